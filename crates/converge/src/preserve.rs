//! Fields owned by someone other than the reconciler.
//!
//! CA bundles are injected into webhook configurations after creation (by a cert
//! controller or the bootstrap tooling). A template that leaves the bundle empty must
//! not wipe it on the next write.

use std::fmt;

use crate::{
	resource::{ManagedObject, ResourceKind},
	webhook::{WebhookConfiguration, WebhookEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservedField {
	WebhookCaBundle,
}

impl fmt::Display for PreservedField {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::WebhookCaBundle => f.write_str("webhooks[*].clientConfig.caBundle"),
		}
	}
}

/// Paths of `kind` that keep their observed value unless the template sets them.
pub fn exempt_paths(kind: ResourceKind) -> &'static [PreservedField] {
	match kind {
		ResourceKind::Deployment => &[],
		ResourceKind::MutatingWebhookConfiguration | ResourceKind::ValidatingWebhookConfiguration => {
			&[PreservedField::WebhookCaBundle]
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreservationPolicy;

impl PreservationPolicy {
	/// Desired state with preserved fields carried over from `observed`.
	///
	/// Webhook entries pair by position. For each pair a non-empty desired bundle
	/// wins; otherwise a non-empty observed bundle is kept.
	pub fn apply(&self, desired: &ManagedObject, observed: Option<&ManagedObject>) -> ManagedObject {
		let mut merged = desired.clone();
		let Some(observed) = observed else {
			return merged;
		};
		match (&mut merged, observed) {
			(
				ManagedObject::MutatingWebhookConfiguration(merged),
				ManagedObject::MutatingWebhookConfiguration(observed),
			) => keep_ca_bundles(merged, observed),
			(
				ManagedObject::ValidatingWebhookConfiguration(merged),
				ManagedObject::ValidatingWebhookConfiguration(observed),
			) => keep_ca_bundles(merged, observed),
			_ => {}
		}
		merged
	}
}

fn keep_ca_bundles<C: WebhookConfiguration>(merged: &mut C, observed: &C) {
	if merged.entries_option().is_none() {
		return;
	}
	for (index, (entry, seen)) in merged
		.entries_mut()
		.iter_mut()
		.zip(observed.entries())
		.enumerate()
	{
		if entry.ca_bundle().is_empty() && !seen.ca_bundle().is_empty() {
			tracing::trace!(index, webhook = entry.name(), "keeping injected caBundle");
			entry.set_ca_bundle(seen.client_config().ca_bundle.clone());
		}
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;
	use crate::{
		diff::{diff, DiffAction, FieldPath},
		test_utils::{ca_bundles, deployment, hook, mutating_webhooks, validating_webhooks},
		webhook::WebhookField,
	};

	#[rstest]
	#[case::desired_wins(b"new".as_slice(), b"old".as_slice(), b"new".as_slice())]
	#[case::observed_kept(b"".as_slice(), b"old".as_slice(), b"old".as_slice())]
	#[case::both_empty(b"".as_slice(), b"".as_slice(), b"".as_slice())]
	fn test_bundle_rules(#[case] desired: &[u8], #[case] observed: &[u8], #[case] expected: &[u8]) {
		let desired = validating_webhooks("hooks", &[hook("a.example.io", desired, &["v1"])]);
		let observed = validating_webhooks("hooks", &[hook("a.example.io", observed, &["v1"])]);

		let merged = PreservationPolicy.apply(&desired, Some(&observed));
		assert_eq!(ca_bundles(&merged), vec![expected.to_vec()]);
	}

	#[test]
	fn test_bundle_survives_version_update() {
		let desired = validating_webhooks("hooks", &[hook("a.example.io", b"", &["v2"])]);
		let observed = validating_webhooks("hooks", &[hook("a.example.io", &[0x01, 0x02], &["v1"])]);

		let merged = PreservationPolicy.apply(&desired, Some(&observed));
		let DiffAction::Update(patch) = diff(&merged, Some(&observed)).expect("diff") else {
			panic!("expected update");
		};
		assert_eq!(
			patch.changes(),
			&[FieldPath::Webhook {
				index: 0,
				field: WebhookField::AdmissionReviewVersions,
			}]
		);

		let written = patch.apply(&merged, &observed).expect("apply");
		assert_eq!(ca_bundles(&written), vec![vec![0x01, 0x02]]);
	}

	#[test]
	fn test_pairs_by_position() {
		let desired = mutating_webhooks(
			"hooks",
			&[hook("a.example.io", b"", &["v1"]), hook("b.example.io", b"", &["v1"])],
		);
		let observed = mutating_webhooks("hooks", &[hook("a.example.io", b"ca-a", &["v1"])]);

		let merged = PreservationPolicy.apply(&desired, Some(&observed));
		assert_eq!(ca_bundles(&merged), vec![b"ca-a".to_vec(), Vec::new()]);
	}

	#[test]
	fn test_deployments_have_no_exempt_paths() {
		assert!(exempt_paths(ResourceKind::Deployment).is_empty());
		assert_eq!(
			exempt_paths(ResourceKind::ValidatingWebhookConfiguration)[0].to_string(),
			"webhooks[*].clientConfig.caBundle"
		);

		let desired = deployment("controllers", 2);
		assert_eq!(PreservationPolicy.apply(&desired, None), desired);
	}
}
