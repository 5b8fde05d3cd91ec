//! Canonical objects the reconciler converges to.

use std::{
	collections::{BTreeMap, HashSet},
	fmt, fs,
	path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
	resource::{ManagedObject, ManifestError, ResourceKind, ResourceRef},
	webhook::{WebhookConfiguration, WebhookEntry},
};

/// Why a desired object cannot be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
	MissingName,
	MissingNamespace,
	/// The object names a different identity than the one it was requested for.
	IdentityMismatch { actual: ResourceRef },
	MissingSpec,
	MissingSelector,
	MissingTemplateLabels,
	/// Pod template labels do not satisfy the selector.
	SelectorMismatch,
	NoWebhooks,
	NoAdmissionReviewVersions { webhook: String },
	DuplicateWebhook { webhook: String },
}

impl fmt::Display for ValidationFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::MissingName => f.write_str("metadata.name is empty"),
			Self::MissingNamespace => f.write_str("metadata.namespace is empty"),
			Self::IdentityMismatch { actual } => write!(f, "object is {actual}"),
			Self::MissingSpec => f.write_str("spec is missing"),
			Self::MissingSelector => f.write_str("spec.selector has no matchLabels or matchExpressions"),
			Self::MissingTemplateLabels => f.write_str("spec.template.metadata.labels is empty"),
			Self::SelectorMismatch => {
				f.write_str("spec.selector does not match spec.template.metadata.labels")
			}
			Self::NoWebhooks => f.write_str("webhooks is empty"),
			Self::NoAdmissionReviewVersions { webhook } => {
				write!(f, "webhook {webhook} has no admissionReviewVersions")
			}
			Self::DuplicateWebhook { webhook } => write!(f, "webhook {webhook} is listed twice"),
		}
	}
}

#[derive(Debug, Error)]
pub enum DesiredStateError {
	#[error("{resource} is not managed")]
	Unmanaged { resource: ResourceRef },

	#[error("desired {resource} is invalid: {failure}")]
	Invalid {
		resource: ResourceRef,
		failure: ValidationFailure,
	},

	#[error("template document {index} is invalid: {failure}")]
	InvalidDocument {
		index: usize,
		failure: ValidationFailure,
	},

	#[error("template {resource} is defined more than once")]
	Duplicate { resource: ResourceRef },

	#[error("failed to read templates from {path}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse template document {index}")]
	Parse {
		index: usize,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("failed to decode template document {index}")]
	Manifest {
		index: usize,
		#[source]
		source: ManifestError,
	},
}

/// Source of desired state, read once per reconcile.
pub trait DesiredStateProvider: Send + Sync {
	/// Identities to keep converged.
	fn managed(&self) -> Vec<ResourceRef>;

	/// The desired object for `resource`, already validated.
	fn desired(&self, resource: &ResourceRef) -> Result<ManagedObject, DesiredStateError>;
}

/// Check `object` is writable as the desired state of `target`.
pub fn validate(target: &ResourceRef, object: &ManagedObject) -> Result<(), DesiredStateError> {
	check(target, object).map_err(|failure| DesiredStateError::Invalid {
		resource: target.clone(),
		failure,
	})
}

fn check(target: &ResourceRef, object: &ManagedObject) -> Result<(), ValidationFailure> {
	if object.name().is_none_or(str::is_empty) {
		return Err(ValidationFailure::MissingName);
	}
	if target.kind == ResourceKind::Deployment
		&& object.metadata().namespace.as_deref().is_none_or(str::is_empty)
	{
		return Err(ValidationFailure::MissingNamespace);
	}
	let actual = object.resource_ref().ok_or(ValidationFailure::MissingName)?;
	if &actual != target {
		return Err(ValidationFailure::IdentityMismatch { actual });
	}

	match object {
		ManagedObject::Deployment(deployment) => {
			let spec = deployment.spec.as_ref().ok_or(ValidationFailure::MissingSpec)?;
			let match_labels = spec.selector.match_labels.clone().unwrap_or_default();
			let has_expressions = spec
				.selector
				.match_expressions
				.as_ref()
				.is_some_and(|e| !e.is_empty());
			if match_labels.is_empty() && !has_expressions {
				return Err(ValidationFailure::MissingSelector);
			}
			let template_labels = spec
				.template
				.metadata
				.as_ref()
				.and_then(|m| m.labels.clone())
				.unwrap_or_default();
			if template_labels.is_empty() {
				return Err(ValidationFailure::MissingTemplateLabels);
			}
			if match_labels
				.iter()
				.any(|(k, v)| template_labels.get(k) != Some(v))
			{
				return Err(ValidationFailure::SelectorMismatch);
			}
			Ok(())
		}
		ManagedObject::MutatingWebhookConfiguration(c) => check_webhooks(c),
		ManagedObject::ValidatingWebhookConfiguration(c) => check_webhooks(c),
	}
}

fn check_webhooks<C: WebhookConfiguration>(config: &C) -> Result<(), ValidationFailure> {
	let entries = config.entries();
	if entries.is_empty() {
		return Err(ValidationFailure::NoWebhooks);
	}
	let mut seen = HashSet::new();
	for entry in entries {
		if entry.admission_review_versions().is_empty() {
			return Err(ValidationFailure::NoAdmissionReviewVersions {
				webhook: entry.name().to_string(),
			});
		}
		if !seen.insert(entry.name()) {
			return Err(ValidationFailure::DuplicateWebhook {
				webhook: entry.name().to_string(),
			});
		}
	}
	Ok(())
}

/// Fixed desired state, typically loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDesiredState {
	objects: BTreeMap<ResourceRef, ManagedObject>,
}

impl StaticDesiredState {
	pub fn new(
		objects: impl IntoIterator<Item = ManagedObject>,
	) -> Result<Self, DesiredStateError> {
		let mut state = Self::default();
		for (index, object) in objects.into_iter().enumerate() {
			state.insert(index, object)?;
		}
		Ok(state)
	}

	fn insert(&mut self, index: usize, object: ManagedObject) -> Result<(), DesiredStateError> {
		let resource = object
			.resource_ref()
			.ok_or(DesiredStateError::InvalidDocument {
				index,
				failure: ValidationFailure::MissingName,
			})?;
		validate(&resource, &object)?;
		if self.objects.contains_key(&resource) {
			return Err(DesiredStateError::Duplicate { resource });
		}
		debug!(resource = %resource, "loaded desired state");
		self.objects.insert(resource, object);
		Ok(())
	}

	/// Parse a multi-document YAML stream of manifests. Empty documents are skipped.
	pub fn from_yaml_str(content: &str) -> Result<Self, DesiredStateError> {
		let mut state = Self::default();
		for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
			let value = serde_json::Value::deserialize(document)
				.map_err(|source| DesiredStateError::Parse { index, source })?;
			if value.is_null() {
				continue;
			}
			let object = ManagedObject::from_manifest(value)
				.map_err(|source| DesiredStateError::Manifest { index, source })?;
			state.insert(index, object)?;
		}
		Ok(state)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DesiredStateError> {
		let path = path.as_ref();
		let content = fs::read_to_string(path).map_err(|source| DesiredStateError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_yaml_str(&content)
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}
}

impl DesiredStateProvider for StaticDesiredState {
	fn managed(&self) -> Vec<ResourceRef> {
		self.objects.keys().cloned().collect()
	}

	fn desired(&self, resource: &ResourceRef) -> Result<ManagedObject, DesiredStateError> {
		let object = self
			.objects
			.get(resource)
			.ok_or_else(|| DesiredStateError::Unmanaged {
				resource: resource.clone(),
			})?;
		validate(resource, object)?;
		Ok(object.clone())
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use assert_matches::assert_matches;
	use indoc::indoc;

	use super::*;
	use crate::test_utils::{deployment, hook, validating_webhooks};

	const TEMPLATES: &str = indoc! {r#"
		apiVersion: apps/v1
		kind: Deployment
		metadata:
		  name: controllers
		  namespace: machine-api
		spec:
		  replicas: 3
		  selector:
		    matchLabels:
		      app: controllers
		  template:
		    metadata:
		      labels:
		        app: controllers
		    spec:
		      containers:
		        - name: controller
		          image: registry.example.io/controller:v1
		---
		---
		apiVersion: admissionregistration.k8s.io/v1
		kind: ValidatingWebhookConfiguration
		metadata:
		  name: hooks
		webhooks:
		  - name: a.example.io
		    admissionReviewVersions: ["v1"]
		    sideEffects: None
		    clientConfig:
		      url: https://hooks.example.io/validate
	"#};

	#[test]
	fn test_from_yaml_str_skips_empty_documents() {
		let state = StaticDesiredState::from_yaml_str(TEMPLATES).expect("templates");
		assert_eq!(
			state.managed(),
			vec![
				ResourceRef::deployment("machine-api", "controllers"),
				ResourceRef::validating_webhook_configuration("hooks"),
			]
		);
		let desired = state
			.desired(&ResourceRef::deployment("machine-api", "controllers"))
			.expect("desired");
		assert_eq!(
			desired.as_deployment().and_then(|d| d.spec.as_ref()?.replicas),
			Some(3)
		);
	}

	#[test]
	fn test_from_file() {
		let mut file = tempfile::NamedTempFile::new().expect("tempfile");
		file.write_all(TEMPLATES.as_bytes()).expect("write");
		let state = StaticDesiredState::from_file(file.path()).expect("templates");
		assert_eq!(state.managed().len(), 2);

		assert_matches!(
			StaticDesiredState::from_file("/nonexistent/templates.yaml"),
			Err(DesiredStateError::Read { .. })
		);
	}

	#[test]
	fn test_unmanaged_resource() {
		let state = StaticDesiredState::new([deployment("controllers", 1)]).expect("state");
		assert_matches!(
			state.desired(&ResourceRef::mutating_webhook_configuration("hooks")),
			Err(DesiredStateError::Unmanaged { .. })
		);
	}

	#[test]
	fn test_duplicate_template() {
		let result = StaticDesiredState::new([deployment("controllers", 1), deployment("controllers", 2)]);
		assert_matches!(result, Err(DesiredStateError::Duplicate { .. }));
	}

	#[test]
	fn test_validation_failures() {
		let hooks = ResourceRef::validating_webhook_configuration("hooks");

		let empty = validating_webhooks("hooks", &[]);
		assert_matches!(
			validate(&hooks, &empty),
			Err(DesiredStateError::Invalid { failure: ValidationFailure::NoWebhooks, .. })
		);

		let no_versions = validating_webhooks("hooks", &[hook("a.example.io", b"", &[])]);
		assert_matches!(
			validate(&hooks, &no_versions),
			Err(DesiredStateError::Invalid {
				failure: ValidationFailure::NoAdmissionReviewVersions { .. },
				..
			})
		);

		let duplicate = validating_webhooks(
			"hooks",
			&[hook("a.example.io", b"", &["v1"]), hook("a.example.io", b"", &["v1"])],
		);
		assert_matches!(
			validate(&hooks, &duplicate),
			Err(DesiredStateError::Invalid {
				failure: ValidationFailure::DuplicateWebhook { .. },
				..
			})
		);

		let other = validating_webhooks("other", &[hook("a.example.io", b"", &["v1"])]);
		assert_matches!(
			validate(&hooks, &other),
			Err(DesiredStateError::Invalid {
				failure: ValidationFailure::IdentityMismatch { .. },
				..
			})
		);
	}

	#[test]
	fn test_selector_must_match_template() {
		let mut object = deployment("controllers", 1);
		if let ManagedObject::Deployment(d) = &mut object {
			let spec = d.spec.as_mut().expect("spec");
			spec.selector.match_labels = Some([("app".to_string(), "other".to_string())].into());
		}
		assert_matches!(
			validate(&ResourceRef::deployment("machine-api", "controllers"), &object),
			Err(DesiredStateError::Invalid {
				failure: ValidationFailure::SelectorMismatch,
				..
			})
		);
	}
}
