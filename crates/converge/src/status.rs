//! Availability of managed components and the aggregated operator conditions.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use crate::{
	client::ResourceClient,
	reconcile::{StateTracker, SyncState},
	resource::{ManagedObject, ResourceRef},
};

/// Every desired replica is ready and the `Available` condition is `True`.
///
/// An unset replica count means one.
pub fn is_deployment_available(deployment: &Deployment) -> bool {
	let desired = deployment
		.spec
		.as_ref()
		.and_then(|s| s.replicas)
		.unwrap_or(1);
	let Some(status) = &deployment.status else {
		return false;
	};
	let condition_true = status
		.conditions
		.iter()
		.flatten()
		.any(|c| c.type_ == "Available" && c.status == "True");
	status.ready_replicas.unwrap_or(0) == desired && condition_true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
	Available,
	Progressing,
	Degraded,
}

impl fmt::Display for ConditionType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Available => "Available",
			Self::Progressing => "Progressing",
			Self::Degraded => "Degraded",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
	pub type_: ConditionType,
	pub status: bool,
	pub reason: &'static str,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentStatus {
	pub resource: ResourceRef,
	pub available: bool,
	pub state: SyncState,
	pub last_error: Option<String>,
}

impl ComponentStatus {
	fn progressing(&self) -> bool {
		matches!(
			self.state,
			SyncState::Creating | SyncState::Drifted | SyncState::Reconciling
		) || (!self.available && self.state != SyncState::Failed)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorStatus {
	pub components: Vec<ComponentStatus>,
	pub conditions: Vec<Condition>,
}

impl OperatorStatus {
	pub fn from_components(components: Vec<ComponentStatus>) -> Self {
		let names = |pred: &dyn Fn(&ComponentStatus) -> bool| {
			components
				.iter()
				.filter(|c| pred(c))
				.map(|c| c.resource.to_string())
				.collect::<Vec<_>>()
		};

		let unavailable = names(&|c: &ComponentStatus| !c.available);
		let progressing = names(&ComponentStatus::progressing);
		let failed = names(&|c: &ComponentStatus| c.state == SyncState::Failed);

		let conditions = vec![
			if unavailable.is_empty() {
				Condition {
					type_: ConditionType::Available,
					status: true,
					reason: "AsExpected",
					message: "all managed resources are available".to_string(),
				}
			} else {
				Condition {
					type_: ConditionType::Available,
					status: false,
					reason: "ComponentsUnavailable",
					message: format!("unavailable: {}", unavailable.join(", ")),
				}
			},
			Condition {
				type_: ConditionType::Progressing,
				status: !progressing.is_empty(),
				reason: if progressing.is_empty() { "AsExpected" } else { "Reconciling" },
				message: progressing.join(", "),
			},
			Condition {
				type_: ConditionType::Degraded,
				status: !failed.is_empty(),
				reason: if failed.is_empty() { "AsExpected" } else { "ReconcileFailed" },
				message: components
					.iter()
					.filter(|c| c.state == SyncState::Failed)
					.filter_map(|c| Some(format!("{}: {}", c.resource, c.last_error.as_ref()?)))
					.collect::<Vec<_>>()
					.join("; "),
			},
		];

		Self {
			components,
			conditions,
		}
	}

	pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
		self.conditions.iter().find(|c| c.type_ == type_)
	}

	pub fn is_available(&self) -> bool {
		self.condition(ConditionType::Available)
			.is_some_and(|c| c.status)
	}
}

/// Read every managed resource and combine it with the tracked sync state.
pub async fn collect<C: ResourceClient>(
	client: &C,
	tracker: &StateTracker,
	managed: &[ResourceRef],
) -> OperatorStatus {
	let mut components = Vec::with_capacity(managed.len());
	for resource in managed {
		let tracked = tracker.get(resource);
		let (available, last_error) = match client.get(resource).await {
			Ok(observed) => (component_available(observed.as_ref()), tracked.last_error),
			Err(err) => {
				debug!(resource = %resource, error = %err, "status read failed");
				(false, Some(err.to_string()))
			}
		};
		components.push(ComponentStatus {
			resource: resource.clone(),
			available,
			state: tracked.state,
			last_error,
		});
	}
	OperatorStatus::from_components(components)
}

fn component_available(observed: Option<&ManagedObject>) -> bool {
	match observed {
		Some(ManagedObject::Deployment(d)) => is_deployment_available(d),
		Some(_) => true,
		None => false,
	}
}
