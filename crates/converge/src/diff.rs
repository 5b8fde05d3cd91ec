//! Desired vs observed comparison producing typed patches.
//!
//! Only fields set in the desired document are compared: anything the API server
//! defaults or another controller adds is left alone, so a converged object never
//! shows perpetual drift. Sequences pair up by position and must agree in length.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
	resource::{ManagedObject, ResourceKind},
	webhook::{WebhookConfiguration, WebhookEntry, WebhookField},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
	Labels,
	Annotations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentField {
	Replicas,
	Selector,
	Template,
	Strategy,
	MinReadySeconds,
	RevisionHistoryLimit,
	ProgressDeadlineSeconds,
	Paused,
}

impl fmt::Display for DeploymentField {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Replicas => "spec.replicas",
			Self::Selector => "spec.selector",
			Self::Template => "spec.template",
			Self::Strategy => "spec.strategy",
			Self::MinReadySeconds => "spec.minReadySeconds",
			Self::RevisionHistoryLimit => "spec.revisionHistoryLimit",
			Self::ProgressDeadlineSeconds => "spec.progressDeadlineSeconds",
			Self::Paused => "spec.paused",
		})
	}
}

/// A path into a managed object that a [`Patch`] rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldPath {
	Metadata(MetadataField),
	Deployment(DeploymentField),
	/// The whole webhook list, used when entries no longer pair up by position.
	Webhooks,
	Webhook { index: usize, field: WebhookField },
}

impl fmt::Display for FieldPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Metadata(MetadataField::Labels) => f.write_str("metadata.labels"),
			Self::Metadata(MetadataField::Annotations) => f.write_str("metadata.annotations"),
			Self::Deployment(field) => write!(f, "{field}"),
			Self::Webhooks => f.write_str("webhooks"),
			Self::Webhook { index, field } => write!(f, "webhooks[{index}].{field}"),
		}
	}
}

#[derive(Debug, Error)]
pub enum DiffError {
	#[error("cannot compare desired {desired} against observed {observed}")]
	KindMismatch {
		desired: ResourceKind,
		observed: ResourceKind,
	},

	#[error("patch path {path} does not exist on the observed object")]
	MissingPath { path: FieldPath },
}

/// Ordered set of paths to copy from desired into observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
	changes: Vec<FieldPath>,
}

impl Patch {
	fn push(&mut self, path: FieldPath) {
		if !self.changes.contains(&path) {
			self.changes.push(path);
		}
	}

	pub fn changes(&self) -> &[FieldPath] {
		&self.changes
	}

	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	pub fn len(&self) -> usize {
		self.changes.len()
	}

	/// Build the object to write: `observed` with every patched path taken from `desired`.
	///
	/// Observed metadata (uid, resourceVersion, server-managed fields) is kept so the
	/// write is a compare-and-swap against what was read.
	pub fn apply(
		&self,
		desired: &ManagedObject,
		observed: &ManagedObject,
	) -> Result<ManagedObject, DiffError> {
		check_kinds(desired, observed)?;
		let mut merged = observed.clone();

		for path in &self.changes {
			match *path {
				FieldPath::Metadata(field) => {
					let source = match field {
						MetadataField::Labels => &desired.metadata().labels,
						MetadataField::Annotations => &desired.metadata().annotations,
					};
					let Some(source) = source else { continue };
					let metadata = merged.metadata_mut();
					let target = match field {
						MetadataField::Labels => &mut metadata.labels,
						MetadataField::Annotations => &mut metadata.annotations,
					};
					target
						.get_or_insert_with(Default::default)
						.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
				}
				FieldPath::Deployment(field) => {
					let (ManagedObject::Deployment(desired), ManagedObject::Deployment(merged)) =
						(desired, &mut merged)
					else {
						return Err(DiffError::MissingPath { path: *path });
					};
					apply_deployment_field(desired, merged, field);
				}
				FieldPath::Webhooks | FieldPath::Webhook { .. } => match (desired, &mut merged) {
					(
						ManagedObject::MutatingWebhookConfiguration(desired),
						ManagedObject::MutatingWebhookConfiguration(merged),
					) => apply_webhook_path(desired, merged, *path)?,
					(
						ManagedObject::ValidatingWebhookConfiguration(desired),
						ManagedObject::ValidatingWebhookConfiguration(merged),
					) => apply_webhook_path(desired, merged, *path)?,
					_ => return Err(DiffError::MissingPath { path: *path }),
				},
			}
		}

		Ok(merged)
	}
}

impl fmt::Display for Patch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, path) in self.changes.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			write!(f, "{path}")?;
		}
		Ok(())
	}
}

fn apply_deployment_field(desired: &Deployment, merged: &mut Deployment, field: DeploymentField) {
	let Some(from) = &desired.spec else { return };
	let to = merged.spec.get_or_insert_with(DeploymentSpec::default);
	match field {
		DeploymentField::Replicas => to.replicas = from.replicas,
		DeploymentField::Selector => to.selector = from.selector.clone(),
		DeploymentField::Template => to.template = from.template.clone(),
		DeploymentField::Strategy => to.strategy = from.strategy.clone(),
		DeploymentField::MinReadySeconds => to.min_ready_seconds = from.min_ready_seconds,
		DeploymentField::RevisionHistoryLimit => {
			to.revision_history_limit = from.revision_history_limit;
		}
		DeploymentField::ProgressDeadlineSeconds => {
			to.progress_deadline_seconds = from.progress_deadline_seconds;
		}
		DeploymentField::Paused => to.paused = from.paused,
	}
}

fn apply_webhook_path<C: WebhookConfiguration>(
	desired: &C,
	merged: &mut C,
	path: FieldPath,
) -> Result<(), DiffError> {
	match path {
		FieldPath::Webhooks => merged.set_entries(desired.entries_option().clone()),
		FieldPath::Webhook { index, field } => {
			let (Some(from), Some(to)) = (
				desired.entries().get(index),
				merged.entries_mut().get_mut(index),
			) else {
				return Err(DiffError::MissingPath { path });
			};
			to.copy_field(from, field);
		}
		_ => return Err(DiffError::MissingPath { path }),
	}
	Ok(())
}

/// What it takes to bring observed to desired.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffAction {
	/// Nothing exists yet; create the desired object as is.
	Create(ManagedObject),
	Update(Patch),
	NoOp,
}

impl DiffAction {
	pub fn has_changes(&self) -> bool {
		!matches!(self, Self::NoOp)
	}
}

impl fmt::Display for DiffAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Create(_) => f.write_str("create"),
			Self::Update(patch) => write!(f, "update [{patch}]"),
			Self::NoOp => f.write_str("no-op"),
		}
	}
}

/// Compare `desired` against what the cluster currently holds.
///
/// Run [`crate::PreservationPolicy::apply`] on `desired` first so preserved fields
/// already equal their observed values.
pub fn diff(
	desired: &ManagedObject,
	observed: Option<&ManagedObject>,
) -> Result<DiffAction, DiffError> {
	let Some(observed) = observed else {
		return Ok(DiffAction::Create(desired.clone()));
	};
	check_kinds(desired, observed)?;

	let mut patch = Patch::default();

	let (d, o) = (desired.metadata(), observed.metadata());
	if !option_covers(&d.labels, &o.labels) {
		patch.push(FieldPath::Metadata(MetadataField::Labels));
	}
	if !option_covers(&d.annotations, &o.annotations) {
		patch.push(FieldPath::Metadata(MetadataField::Annotations));
	}

	match (desired, observed) {
		(ManagedObject::Deployment(d), ManagedObject::Deployment(o)) => {
			deployment_changes(d, o, &mut patch);
		}
		(
			ManagedObject::MutatingWebhookConfiguration(d),
			ManagedObject::MutatingWebhookConfiguration(o),
		) => webhook_changes(d, o, &mut patch),
		(
			ManagedObject::ValidatingWebhookConfiguration(d),
			ManagedObject::ValidatingWebhookConfiguration(o),
		) => webhook_changes(d, o, &mut patch),
		_ => {
			return Err(DiffError::KindMismatch {
				desired: desired.kind(),
				observed: observed.kind(),
			})
		}
	}

	Ok(if patch.is_empty() {
		DiffAction::NoOp
	} else {
		DiffAction::Update(patch)
	})
}

fn check_kinds(desired: &ManagedObject, observed: &ManagedObject) -> Result<(), DiffError> {
	if desired.kind() == observed.kind() {
		Ok(())
	} else {
		Err(DiffError::KindMismatch {
			desired: desired.kind(),
			observed: observed.kind(),
		})
	}
}

fn deployment_changes(desired: &Deployment, observed: &Deployment, patch: &mut Patch) {
	let Some(d) = &desired.spec else { return };
	let default_spec = DeploymentSpec::default();
	let o = observed.spec.as_ref().unwrap_or(&default_spec);

	let checks = [
		(option_covers(&d.replicas, &o.replicas), DeploymentField::Replicas),
		(covers(&d.selector, &o.selector), DeploymentField::Selector),
		(covers(&d.template, &o.template), DeploymentField::Template),
		(option_covers(&d.strategy, &o.strategy), DeploymentField::Strategy),
		(
			option_covers(&d.min_ready_seconds, &o.min_ready_seconds),
			DeploymentField::MinReadySeconds,
		),
		(
			option_covers(&d.revision_history_limit, &o.revision_history_limit),
			DeploymentField::RevisionHistoryLimit,
		),
		(
			option_covers(&d.progress_deadline_seconds, &o.progress_deadline_seconds),
			DeploymentField::ProgressDeadlineSeconds,
		),
		(option_covers(&d.paused, &o.paused), DeploymentField::Paused),
	];
	for (covered, field) in checks {
		if !covered {
			patch.push(FieldPath::Deployment(field));
		}
	}
}

fn webhook_changes<C: WebhookConfiguration>(desired: &C, observed: &C, patch: &mut Patch) {
	if desired.entries_option().is_none() {
		return;
	}
	let (d, o) = (desired.entries(), observed.entries());
	let paired = d.len() == o.len() && d.iter().zip(o).all(|(d, o)| d.name() == o.name());
	if !paired {
		patch.push(FieldPath::Webhooks);
		return;
	}
	for (index, (d, o)) in d.iter().zip(o).enumerate() {
		for field in C::Entry::differences(d, o) {
			patch.push(FieldPath::Webhook { index, field });
		}
	}
}

/// Whether `observed` carries every field `desired` sets, with equal values.
pub(crate) fn covers<T: Serialize>(desired: &T, observed: &T) -> bool {
	match (serde_json::to_value(desired), serde_json::to_value(observed)) {
		(Ok(desired), Ok(observed)) => value_covers(&desired, &observed),
		_ => false,
	}
}

/// [`covers`] for optional fields: an unset desired value is not managed.
pub(crate) fn option_covers<T: Serialize>(desired: &Option<T>, observed: &Option<T>) -> bool {
	match (desired, observed) {
		(None, _) => true,
		(Some(desired), Some(observed)) => covers(desired, observed),
		(Some(desired), None) => {
			serde_json::to_value(desired).is_ok_and(|desired| value_covers(&desired, &Value::Null))
		}
	}
}

fn value_covers(desired: &Value, observed: &Value) -> bool {
	match (desired, observed) {
		(Value::Null, _) => true,
		(Value::Object(d), Value::Object(o)) => d
			.iter()
			.all(|(key, d)| value_covers(d, o.get(key).unwrap_or(&Value::Null))),
		(Value::Array(d), Value::Array(o)) => {
			d.len() == o.len() && d.iter().zip(o).all(|(d, o)| value_covers(d, o))
		}
		// empty collections and absent fields are the same thing on the wire
		(Value::Object(d), Value::Null) => d.values().all(|d| value_covers(d, &Value::Null)),
		(Value::Array(d), Value::Null) => d.is_empty(),
		// the API server omits zero scalars from responses
		(Value::Bool(false), Value::Null) => true,
		(Value::Number(n), Value::Null) => n.as_f64() == Some(0.0),
		(Value::String(s), Value::Null) => s.is_empty(),
		(d, o) => d == o,
	}
}
