//! Mock Kubernetes API resource table.
//!
//! The mock server does not serve discovery endpoints; the table is only used to
//! derive REST paths for seeded manifests and to recognise which collections get
//! simulated controller behaviour.

use std::collections::HashMap;

/// Resource types known to the mock server, grouped by apiVersion.
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	pub group_resources: HashMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: HashMap::from([
				(
					"apps/v1".to_string(),
					vec![MockApiResource::namespaced("deployments", "Deployment")],
				),
				(
					"admissionregistration.k8s.io/v1".to_string(),
					vec![
						MockApiResource::cluster_scoped(
							"mutatingwebhookconfigurations",
							"MutatingWebhookConfiguration",
						),
						MockApiResource::cluster_scoped(
							"validatingwebhookconfigurations",
							"ValidatingWebhookConfiguration",
						),
					],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Find the resource entry for an apiVersion/kind pair.
	pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		if api_version.contains('/') {
			self.group_resources
				.get(api_version)?
				.iter()
				.find(|r| r.kind == kind)
		} else {
			self.core_resources.iter().find(|r| r.kind == kind)
		}
	}

	/// Whether `name` is the plural name of a served resource.
	pub fn serves(&self, name: &str) -> bool {
		self.core_resources
			.iter()
			.chain(self.group_resources.values().flatten())
			.any(|r| r.name == name)
	}

	/// Build the collection path for a resource, e.g.
	/// `/apis/apps/v1/namespaces/default/deployments`.
	pub fn collection_path(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
	) -> Option<String> {
		let resource = self.lookup(api_version, kind)?;
		let root = if api_version.contains('/') {
			"apis"
		} else {
			"api"
		};

		let path = if resource.namespaced {
			let ns = namespace.unwrap_or("default");
			format!("/{}/{}/namespaces/{}/{}", root, api_version, ns, resource.name)
		} else {
			format!("/{}/{}/{}", root, api_version, resource.name)
		};
		Some(path)
	}
}

/// A mock API resource definition.
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: true,
		}
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: false,
		}
	}
}
