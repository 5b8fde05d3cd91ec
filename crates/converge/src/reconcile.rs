//! Fetch, preserve, diff and write for a single managed resource.
//!
//! A reconcile is strictly sequential for one identity. Writes are compare-and-swap on
//! resourceVersion, so a concurrent writer turns into a conflict and a rerun of the
//! whole cycle against fresh state.

use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	sync::{Mutex, MutexGuard, PoisonError},
};

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
	backoff::{retry_transient, Backoff},
	client::{ClientError, Operation, ResourceClient},
	config::ReconcileConfig,
	desired::{DesiredStateError, DesiredStateProvider},
	diff::{diff, DiffAction, DiffError, FieldPath},
	preserve::PreservationPolicy,
	resource::{ManagedObject, ResourceRef},
};

/// Where a resource is in its reconcile lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
	#[default]
	Absent,
	Creating,
	Synced,
	Drifted,
	Reconciling,
	Failed,
}

impl fmt::Display for SyncState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Absent => "Absent",
			Self::Creating => "Creating",
			Self::Synced => "Synced",
			Self::Drifted => "Drifted",
			Self::Reconciling => "Reconciling",
			Self::Failed => "Failed",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
	/// The object was missing and has been created.
	Created {
		uid: Option<String>,
		/// An earlier incarnation had been seen under a different uid.
		recreated: bool,
	},
	Updated {
		changes: Vec<FieldPath>,
	},
	InSync,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("desired state for {resource} unavailable")]
	Validation {
		resource: ResourceRef,
		#[source]
		source: DesiredStateError,
	},

	#[error("cannot diff {resource}")]
	Diff {
		resource: ResourceRef,
		#[source]
		source: DiffError,
	},

	#[error("{action} of {resource} kept conflicting after {attempts} attempts")]
	ConflictRetriesExhausted {
		resource: ResourceRef,
		/// The write that lost the last race.
		action: Operation,
		attempts: u32,
	},

	#[error("{action} of {resource} kept failing")]
	Transport {
		resource: ResourceRef,
		action: Operation,
		#[source]
		source: ClientError,
	},

	#[error("{action} of {resource} failed")]
	Fatal {
		resource: ResourceRef,
		action: Operation,
		#[source]
		source: ClientError,
	},
}

impl ReconcileError {
	pub fn resource(&self) -> &ResourceRef {
		match self {
			Self::Validation { resource, .. }
			| Self::Diff { resource, .. }
			| Self::ConflictRetriesExhausted { resource, .. }
			| Self::Transport { resource, .. }
			| Self::Fatal { resource, .. } => resource,
		}
	}

	/// The client call that failed, if any.
	pub fn action(&self) -> Option<Operation> {
		match self {
			Self::ConflictRetriesExhausted { action, .. }
			| Self::Transport { action, .. }
			| Self::Fatal { action, .. } => Some(*action),
			_ => None,
		}
	}
}

/// What is remembered about a resource between reconciles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStatus {
	pub state: SyncState,
	pub uid: Option<String>,
	pub resource_version: Option<String>,
	pub last_error: Option<String>,
}

/// Per-identity sync state, shared between reconciles and status reporting.
#[derive(Debug, Default)]
pub struct StateTracker {
	resources: Mutex<HashMap<ResourceRef, ResourceStatus>>,
}

impl StateTracker {
	fn lock(&self) -> MutexGuard<'_, HashMap<ResourceRef, ResourceStatus>> {
		self.resources.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn get(&self, resource: &ResourceRef) -> ResourceStatus {
		self.lock().get(resource).cloned().unwrap_or_default()
	}

	pub fn state(&self, resource: &ResourceRef) -> SyncState {
		self.get(resource).state
	}

	pub fn snapshot(&self) -> BTreeMap<ResourceRef, ResourceStatus> {
		self.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	fn set_state(&self, resource: &ResourceRef, state: SyncState) {
		let mut resources = self.lock();
		let status = resources.entry(resource.clone()).or_default();
		debug!(resource = %resource, from = %status.state, to = %state, "state transition");
		status.state = state;
	}

	/// Remember `object` as the converged state and return the previously seen uid.
	fn record_synced(&self, resource: &ResourceRef, object: &ManagedObject) -> Option<String> {
		let mut resources = self.lock();
		let status = resources.entry(resource.clone()).or_default();
		status.state = SyncState::Synced;
		status.resource_version = object.resource_version().map(str::to_string);
		status.last_error = None;
		std::mem::replace(&mut status.uid, object.uid().map(str::to_string))
	}

	fn record_failure(&self, resource: &ResourceRef, error: &ReconcileError) {
		let mut resources = self.lock();
		let status = resources.entry(resource.clone()).or_default();
		status.state = SyncState::Failed;
		status.last_error = Some(error.to_string());
	}

	fn last_uid(&self, resource: &ResourceRef) -> Option<String> {
		self.lock().get(resource).and_then(|s| s.uid.clone())
	}
}

/// Result of one fetch-diff-write pass.
enum Step {
	Done(ReconcileOutcome),
	/// Lost a race with another writer; rerun against fresh state.
	Retry(Operation, ClientError),
}

pub struct Reconciler<C, P> {
	client: C,
	provider: P,
	config: ReconcileConfig,
	policy: PreservationPolicy,
	tracker: StateTracker,
}

impl<C, P> Reconciler<C, P>
where
	C: ResourceClient,
	P: DesiredStateProvider,
{
	pub fn new(client: C, provider: P, config: ReconcileConfig) -> Self {
		Self {
			client,
			provider,
			config,
			policy: PreservationPolicy,
			tracker: StateTracker::default(),
		}
	}

	pub fn client(&self) -> &C {
		&self.client
	}

	pub fn provider(&self) -> &P {
		&self.provider
	}

	pub fn config(&self) -> &ReconcileConfig {
		&self.config
	}

	pub fn tracker(&self) -> &StateTracker {
		&self.tracker
	}

	pub fn state(&self, resource: &ResourceRef) -> SyncState {
		self.tracker.state(resource)
	}

	/// Bring one resource to its desired state.
	#[instrument(skip(self), fields(resource = %resource))]
	pub async fn reconcile(&self, resource: &ResourceRef) -> Result<ReconcileOutcome, ReconcileError> {
		let result = self.converge(resource).await;
		if let Err(err) = &result {
			warn!(error = %err, action = ?err.action(), "reconcile failed");
			self.tracker.record_failure(resource, err);
		}
		result
	}

	/// Reconcile every managed resource concurrently.
	pub async fn reconcile_all(
		&self,
	) -> Vec<(ResourceRef, Result<ReconcileOutcome, ReconcileError>)> {
		let managed = self.provider.managed();
		let results = join_all(managed.iter().map(|resource| self.reconcile(resource))).await;
		managed.into_iter().zip(results).collect()
	}

	async fn converge(&self, resource: &ResourceRef) -> Result<ReconcileOutcome, ReconcileError> {
		let desired = self
			.provider
			.desired(resource)
			.map_err(|source| ReconcileError::Validation {
				resource: resource.clone(),
				source,
			})?;

		let mut backoff = Backoff::from_config(&self.config);
		let mut attempts = 0u32;
		loop {
			attempts += 1;
			match self.attempt(resource, &desired).await? {
				Step::Done(outcome) => return Ok(outcome),
				Step::Retry(action, reason) => {
					if attempts > self.config.max_conflict_retries {
						return Err(ReconcileError::ConflictRetriesExhausted {
							resource: resource.clone(),
							action,
							attempts,
						});
					}
					debug!(attempts, %action, reason = %reason, "lost write race, rerunning");
					backoff.wait().await;
				}
			}
		}
	}

	async fn attempt(
		&self,
		resource: &ResourceRef,
		desired: &ManagedObject,
	) -> Result<Step, ReconcileError> {
		let observed = retry_transient(&self.config, "get", || self.client.get(resource))
			.await
			.map_err(|source| self.client_failure(resource, Operation::Get, source))?;

		let Some(observed) = observed else {
			self.tracker.set_state(resource, SyncState::Absent);
			return self.create(resource, desired).await;
		};

		let last_uid = self.tracker.last_uid(resource);
		if last_uid.is_some() && last_uid.as_deref() != observed.uid() {
			info!(
				old_uid = last_uid.as_deref(),
				new_uid = observed.uid(),
				"resource was recreated externally"
			);
		}

		let merged = self.policy.apply(desired, Some(&observed));
		let action = diff(&merged, Some(&observed)).map_err(|source| ReconcileError::Diff {
			resource: resource.clone(),
			source,
		})?;

		match action {
			DiffAction::NoOp => {
				self.tracker.record_synced(resource, &observed);
				debug!("in sync");
				Ok(Step::Done(ReconcileOutcome::InSync))
			}
			DiffAction::Create(object) => self.create(resource, &object).await,
			DiffAction::Update(patch) => {
				self.tracker.set_state(resource, SyncState::Drifted);
				let target = patch
					.apply(&merged, &observed)
					.map_err(|source| ReconcileError::Diff {
						resource: resource.clone(),
						source,
					})?;

				self.tracker.set_state(resource, SyncState::Reconciling);
				info!(changes = %patch, "correcting drift");
				match retry_transient(&self.config, "update", || self.client.update(&target)).await {
					Ok(updated) => {
						self.tracker.record_synced(resource, &updated);
						Ok(Step::Done(ReconcileOutcome::Updated {
							changes: patch.changes().to_vec(),
						}))
					}
					Err(err @ (ClientError::Conflict { .. } | ClientError::NotFound { .. })) => {
						Ok(Step::Retry(Operation::Update, err))
					}
					Err(source) => Err(self.client_failure(resource, Operation::Update, source)),
				}
			}
		}
	}

	async fn create(
		&self,
		resource: &ResourceRef,
		desired: &ManagedObject,
	) -> Result<Step, ReconcileError> {
		self.tracker.set_state(resource, SyncState::Creating);
		match retry_transient(&self.config, "create", || self.client.create(desired)).await {
			Ok(created) => {
				let previous = self.tracker.record_synced(resource, &created);
				let recreated = previous.is_some() && previous.as_deref() != created.uid();
				if recreated {
					info!(
						old_uid = previous.as_deref(),
						new_uid = created.uid(),
						"recreated deleted resource"
					);
				} else {
					info!(uid = created.uid(), "created resource");
				}
				Ok(Step::Done(ReconcileOutcome::Created {
					uid: created.uid().map(str::to_string),
					recreated,
				}))
			}
			Err(err @ ClientError::AlreadyExists { .. }) => Ok(Step::Retry(Operation::Create, err)),
			Err(source) => Err(self.client_failure(resource, Operation::Create, source)),
		}
	}

	fn client_failure(
		&self,
		resource: &ResourceRef,
		action: Operation,
		source: ClientError,
	) -> ReconcileError {
		let resource = resource.clone();
		if source.is_transient() {
			ReconcileError::Transport {
				resource,
				action,
				source,
			}
		} else {
			ReconcileError::Fatal {
				resource,
				action,
				source,
			}
		}
	}
}
