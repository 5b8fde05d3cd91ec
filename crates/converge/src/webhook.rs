//! Uniform access to mutating and validating webhook entries.
//!
//! Both configuration kinds carry an ordered list of webhooks with almost the same
//! shape. The traits here let the diff engine and the preservation policy treat them
//! the same way, pairing entries by position.

use std::fmt;

use k8s_openapi::{
	api::admissionregistration::v1::{
		MutatingWebhook, MutatingWebhookConfiguration, ValidatingWebhook,
		ValidatingWebhookConfiguration, WebhookClientConfig,
	},
	ByteString,
};

use crate::diff::option_covers;

/// A field of a single webhook entry that the diff engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookField {
	ClientConfigService,
	ClientConfigUrl,
	CaBundle,
	AdmissionReviewVersions,
	SideEffects,
	Rules,
	FailurePolicy,
	MatchPolicy,
	NamespaceSelector,
	ObjectSelector,
	TimeoutSeconds,
	MatchConditions,
	ReinvocationPolicy,
}

impl fmt::Display for WebhookField {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::ClientConfigService => "clientConfig.service",
			Self::ClientConfigUrl => "clientConfig.url",
			Self::CaBundle => "clientConfig.caBundle",
			Self::AdmissionReviewVersions => "admissionReviewVersions",
			Self::SideEffects => "sideEffects",
			Self::Rules => "rules",
			Self::FailurePolicy => "failurePolicy",
			Self::MatchPolicy => "matchPolicy",
			Self::NamespaceSelector => "namespaceSelector",
			Self::ObjectSelector => "objectSelector",
			Self::TimeoutSeconds => "timeoutSeconds",
			Self::MatchConditions => "matchConditions",
			Self::ReinvocationPolicy => "reinvocationPolicy",
		})
	}
}

/// One entry of a webhook configuration's `webhooks` list.
pub trait WebhookEntry: Clone {
	fn name(&self) -> &str;

	fn admission_review_versions(&self) -> &[String];

	fn client_config(&self) -> &WebhookClientConfig;

	fn client_config_mut(&mut self) -> &mut WebhookClientConfig;

	/// Fields where `observed` does not satisfy `desired`.
	fn differences(desired: &Self, observed: &Self) -> Vec<WebhookField>;

	/// Overwrite one field with the value from `from`.
	fn copy_field(&mut self, from: &Self, field: WebhookField);

	fn ca_bundle(&self) -> &[u8] {
		self.client_config()
			.ca_bundle
			.as_ref()
			.map_or(&[][..], |b| b.0.as_slice())
	}

	fn set_ca_bundle(&mut self, bundle: Option<ByteString>) {
		self.client_config_mut().ca_bundle = bundle;
	}
}

/// A configuration object holding a list of [`WebhookEntry`].
pub trait WebhookConfiguration {
	type Entry: WebhookEntry;

	fn entries(&self) -> &[Self::Entry];

	fn entries_mut(&mut self) -> &mut Vec<Self::Entry>;

	fn set_entries(&mut self, entries: Option<Vec<Self::Entry>>);

	fn entries_option(&self) -> &Option<Vec<Self::Entry>>;
}

/// Client config differences. An empty desired CA bundle means the template does not
/// manage it, so only a non-empty desired bundle is compared.
fn client_config_differences(
	desired: &WebhookClientConfig,
	observed: &WebhookClientConfig,
	fields: &mut Vec<WebhookField>,
) {
	if !option_covers(&desired.service, &observed.service) {
		fields.push(WebhookField::ClientConfigService);
	}
	if !option_covers(&desired.url, &observed.url) {
		fields.push(WebhookField::ClientConfigUrl);
	}
	let desired_bundle = desired.ca_bundle.as_ref().map_or(&[][..], |b| &b.0[..]);
	let observed_bundle = observed.ca_bundle.as_ref().map_or(&[][..], |b| &b.0[..]);
	if !desired_bundle.is_empty() && desired_bundle != observed_bundle {
		fields.push(WebhookField::CaBundle);
	}
}

macro_rules! webhook_entry {
	($entry:ty, $config:ty $(, $extra_field:ident => $extra_variant:ident)* $(,)?) => {
		impl WebhookEntry for $entry {
			fn name(&self) -> &str {
				&self.name
			}

			fn admission_review_versions(&self) -> &[String] {
				&self.admission_review_versions
			}

			fn client_config(&self) -> &WebhookClientConfig {
				&self.client_config
			}

			fn client_config_mut(&mut self) -> &mut WebhookClientConfig {
				&mut self.client_config
			}

			fn differences(desired: &Self, observed: &Self) -> Vec<WebhookField> {
				let mut fields = Vec::new();
				client_config_differences(&desired.client_config, &observed.client_config, &mut fields);
				if desired.admission_review_versions != observed.admission_review_versions {
					fields.push(WebhookField::AdmissionReviewVersions);
				}
				if desired.side_effects != observed.side_effects {
					fields.push(WebhookField::SideEffects);
				}
				let optional = [
					(option_covers(&desired.rules, &observed.rules), WebhookField::Rules),
					(option_covers(&desired.failure_policy, &observed.failure_policy), WebhookField::FailurePolicy),
					(option_covers(&desired.match_policy, &observed.match_policy), WebhookField::MatchPolicy),
					(option_covers(&desired.namespace_selector, &observed.namespace_selector), WebhookField::NamespaceSelector),
					(option_covers(&desired.object_selector, &observed.object_selector), WebhookField::ObjectSelector),
					(option_covers(&desired.timeout_seconds, &observed.timeout_seconds), WebhookField::TimeoutSeconds),
					(option_covers(&desired.match_conditions, &observed.match_conditions), WebhookField::MatchConditions),
					$((option_covers(&desired.$extra_field, &observed.$extra_field), WebhookField::$extra_variant),)*
				];
				fields.extend(
					optional
						.into_iter()
						.filter(|(covered, _)| !covered)
						.map(|(_, field)| field),
				);
				fields
			}

			fn copy_field(&mut self, from: &Self, field: WebhookField) {
				match field {
					WebhookField::ClientConfigService => {
						self.client_config.service = from.client_config.service.clone();
					}
					WebhookField::ClientConfigUrl => {
						self.client_config.url = from.client_config.url.clone();
					}
					WebhookField::CaBundle => {
						self.client_config.ca_bundle = from.client_config.ca_bundle.clone();
					}
					WebhookField::AdmissionReviewVersions => {
						self.admission_review_versions = from.admission_review_versions.clone();
					}
					WebhookField::SideEffects => self.side_effects = from.side_effects.clone(),
					WebhookField::Rules => self.rules = from.rules.clone(),
					WebhookField::FailurePolicy => self.failure_policy = from.failure_policy.clone(),
					WebhookField::MatchPolicy => self.match_policy = from.match_policy.clone(),
					WebhookField::NamespaceSelector => {
						self.namespace_selector = from.namespace_selector.clone();
					}
					WebhookField::ObjectSelector => {
						self.object_selector = from.object_selector.clone();
					}
					WebhookField::TimeoutSeconds => self.timeout_seconds = from.timeout_seconds,
					WebhookField::MatchConditions => {
						self.match_conditions = from.match_conditions.clone();
					}
					$(WebhookField::$extra_variant => self.$extra_field = from.$extra_field.clone(),)*
					// differences() only reports fields the entry type has
					#[allow(unreachable_patterns)]
					_ => unreachable!("{} has no {field}", stringify!($entry)),
				}
			}
		}

		impl WebhookConfiguration for $config {
			type Entry = $entry;

			fn entries(&self) -> &[Self::Entry] {
				self.webhooks.as_deref().unwrap_or_default()
			}

			fn entries_mut(&mut self) -> &mut Vec<Self::Entry> {
				self.webhooks.get_or_insert_with(Vec::new)
			}

			fn set_entries(&mut self, entries: Option<Vec<Self::Entry>>) {
				self.webhooks = entries;
			}

			fn entries_option(&self) -> &Option<Vec<Self::Entry>> {
				&self.webhooks
			}
		}
	};
}

webhook_entry!(
	MutatingWebhook,
	MutatingWebhookConfiguration,
	reinvocation_policy => ReinvocationPolicy,
);
webhook_entry!(ValidatingWebhook, ValidatingWebhookConfiguration);
