//! Identities and typed objects for the resources the reconciler manages.

use std::fmt;

use k8s_openapi::{
	api::{
		admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
		apps::v1::Deployment,
	},
	apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment).
	Namespaced,

	/// Resource is cluster-wide (e.g., webhook configurations).
	ClusterWide,
}

/// The kinds of object this crate knows how to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
	Deployment,
	MutatingWebhookConfiguration,
	ValidatingWebhookConfiguration,
}

impl ResourceKind {
	pub const ALL: [Self; 3] = [
		Self::Deployment,
		Self::MutatingWebhookConfiguration,
		Self::ValidatingWebhookConfiguration,
	];

	pub fn api_version(self) -> &'static str {
		match self {
			Self::Deployment => "apps/v1",
			Self::MutatingWebhookConfiguration | Self::ValidatingWebhookConfiguration => {
				"admissionregistration.k8s.io/v1"
			}
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Deployment => "Deployment",
			Self::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
			Self::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
		}
	}

	pub fn scope(self) -> ResourceScope {
		match self {
			Self::Deployment => ResourceScope::Namespaced,
			Self::MutatingWebhookConfiguration | Self::ValidatingWebhookConfiguration => {
				ResourceScope::ClusterWide
			}
		}
	}

	/// Resolve a kind from a manifest's `apiVersion`/`kind` pair.
	pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
		Self::ALL
			.into_iter()
			.find(|k| k.api_version() == api_version && k.as_str() == kind)
	}

	pub fn is_webhook_configuration(self) -> bool {
		matches!(
			self,
			Self::MutatingWebhookConfiguration | Self::ValidatingWebhookConfiguration
		)
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Immutable identity of a managed resource.
///
/// `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
	pub kind: ResourceKind,
	pub namespace: Option<String>,
	pub name: String,
}

impl ResourceRef {
	pub fn new(kind: ResourceKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
		let namespace = match kind.scope() {
			ResourceScope::Namespaced => namespace.map(str::to_string),
			ResourceScope::ClusterWide => None,
		};
		Self {
			kind,
			namespace,
			name: name.into(),
		}
	}

	pub fn deployment(namespace: &str, name: impl Into<String>) -> Self {
		Self::new(ResourceKind::Deployment, Some(namespace), name)
	}

	pub fn mutating_webhook_configuration(name: impl Into<String>) -> Self {
		Self::new(ResourceKind::MutatingWebhookConfiguration, None, name)
	}

	pub fn validating_webhook_configuration(name: impl Into<String>) -> Self {
		Self::new(ResourceKind::ValidatingWebhookConfiguration, None, name)
	}
}

impl fmt::Display for ResourceRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
			None => write!(f, "{}/{}", self.kind, self.name),
		}
	}
}

/// Errors turning a raw manifest into a [`ManagedObject`].
#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("unsupported resource type: {api_version}/{kind}")]
	UnsupportedKind { api_version: String, kind: String },

	#[error("decoding {kind} manifest")]
	Decode {
		kind: ResourceKind,
		#[source]
		source: serde_json::Error,
	},
}

/// A managed object of one of the supported kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
	Deployment(Deployment),
	MutatingWebhookConfiguration(MutatingWebhookConfiguration),
	ValidatingWebhookConfiguration(ValidatingWebhookConfiguration),
}

impl ManagedObject {
	/// Decode a manifest (as read from YAML/JSON) into a typed object.
	pub fn from_manifest(manifest: serde_json::Value) -> Result<Self, ManifestError> {
		let api_version = manifest.get("apiVersion").and_then(|v| v.as_str());
		let kind = manifest.get("kind").and_then(|v| v.as_str());
		let (Some(api_version), Some(kind)) = (api_version, kind) else {
			return Err(ManifestError::MissingApiVersionOrKind);
		};

		let resource_kind = ResourceKind::from_type_meta(api_version, kind).ok_or_else(|| {
			ManifestError::UnsupportedKind {
				api_version: api_version.to_string(),
				kind: kind.to_string(),
			}
		})?;

		let decode = |source| ManifestError::Decode {
			kind: resource_kind,
			source,
		};
		Ok(match resource_kind {
			ResourceKind::Deployment => {
				Self::Deployment(serde_json::from_value(manifest).map_err(decode)?)
			}
			ResourceKind::MutatingWebhookConfiguration => {
				Self::MutatingWebhookConfiguration(serde_json::from_value(manifest).map_err(decode)?)
			}
			ResourceKind::ValidatingWebhookConfiguration => Self::ValidatingWebhookConfiguration(
				serde_json::from_value(manifest).map_err(decode)?,
			),
		})
	}

	pub fn kind(&self) -> ResourceKind {
		match self {
			Self::Deployment(_) => ResourceKind::Deployment,
			Self::MutatingWebhookConfiguration(_) => ResourceKind::MutatingWebhookConfiguration,
			Self::ValidatingWebhookConfiguration(_) => ResourceKind::ValidatingWebhookConfiguration,
		}
	}

	pub fn metadata(&self) -> &ObjectMeta {
		match self {
			Self::Deployment(d) => &d.metadata,
			Self::MutatingWebhookConfiguration(c) => &c.metadata,
			Self::ValidatingWebhookConfiguration(c) => &c.metadata,
		}
	}

	pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
		match self {
			Self::Deployment(d) => &mut d.metadata,
			Self::MutatingWebhookConfiguration(c) => &mut c.metadata,
			Self::ValidatingWebhookConfiguration(c) => &mut c.metadata,
		}
	}

	pub fn name(&self) -> Option<&str> {
		self.metadata().name.as_deref()
	}

	pub fn uid(&self) -> Option<&str> {
		self.metadata().uid.as_deref()
	}

	pub fn resource_version(&self) -> Option<&str> {
		self.metadata().resource_version.as_deref()
	}

	/// Identity of this object, if it is named.
	pub fn resource_ref(&self) -> Option<ResourceRef> {
		let metadata = self.metadata();
		Some(ResourceRef::new(
			self.kind(),
			metadata.namespace.as_deref(),
			metadata.name.clone()?,
		))
	}

	pub fn as_deployment(&self) -> Option<&Deployment> {
		match self {
			Self::Deployment(d) => Some(d),
			_ => None,
		}
	}

	/// Copy suitable for a create call: server-owned identity fields cleared.
	pub fn for_create(&self) -> Self {
		let mut object = self.clone();
		let metadata = object.metadata_mut();
		metadata.uid = None;
		metadata.resource_version = None;
		metadata.creation_timestamp = None;
		metadata.generation = None;
		metadata.managed_fields = None;
		if let Self::Deployment(d) = &mut object {
			d.status = None;
		}
		object
	}
}

impl From<Deployment> for ManagedObject {
	fn from(value: Deployment) -> Self {
		Self::Deployment(value)
	}
}

impl From<MutatingWebhookConfiguration> for ManagedObject {
	fn from(value: MutatingWebhookConfiguration) -> Self {
		Self::MutatingWebhookConfiguration(value)
	}
}

impl From<ValidatingWebhookConfiguration> for ManagedObject {
	fn from(value: ValidatingWebhookConfiguration) -> Self {
		Self::ValidatingWebhookConfiguration(value)
	}
}
