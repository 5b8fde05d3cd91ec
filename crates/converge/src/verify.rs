//! Bounded, cancellable waits for a resource to reach a state.
//!
//! The verifier polls the object store directly, independent of the reconcile loop,
//! so it observes the same thing an outside client would. A missing object is a
//! normal observation (`None`) rather than an error.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
	client::{ClientError, ResourceClient},
	diff::{diff, DiffAction},
	preserve::PreservationPolicy,
	resource::{ManagedObject, ResourceRef},
	status::is_deployment_available,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
	/// Give up once this much time has passed since the first poll.
	pub timeout: Duration,
	pub poll_interval: Duration,
}

impl Default for WaitOptions {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(120),
			poll_interval: Duration::from_secs(2),
		}
	}
}

#[derive(Debug, Error)]
pub enum VerifyError {
	#[error("timed out after {waited:?} waiting for {resource} to {expectation}")]
	Timeout {
		resource: ResourceRef,
		expectation: String,
		waited: Duration,
		/// Most recent client failure, if the last poll failed.
		#[source]
		last_error: Option<ClientError>,
	},

	#[error("wait for {resource} cancelled")]
	Cancelled { resource: ResourceRef },
}

/// A condition on the observed state of one resource.
pub trait Predicate {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool;

	/// Human-readable expectation for timeout errors, e.g. "become available".
	fn describe(&self) -> String;

	fn and<P: Predicate>(self, other: P) -> Both<Self, P>
	where
		Self: Sized,
	{
		Both(self, other)
	}
}

impl<F> Predicate for F
where
	F: Fn(Option<&ManagedObject>) -> bool,
{
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		self(observed)
	}

	fn describe(&self) -> String {
		"satisfy the predicate".to_string()
	}
}

pub struct Both<A, B>(A, B);

impl<A: Predicate, B: Predicate> Predicate for Both<A, B> {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		self.0.holds(observed) && self.1.holds(observed)
	}

	fn describe(&self) -> String {
		format!("{} and {}", self.0.describe(), self.1.describe())
	}
}

pub struct Exists;

impl Predicate for Exists {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		observed.is_some()
	}

	fn describe(&self) -> String {
		"exist".to_string()
	}
}

pub fn exists() -> Exists {
	Exists
}

/// Observed state needs no write to match `desired`.
pub struct MatchesDesired {
	desired: ManagedObject,
}

impl Predicate for MatchesDesired {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		let Some(observed) = observed else {
			return false;
		};
		let merged = PreservationPolicy.apply(&self.desired, Some(observed));
		matches!(diff(&merged, Some(observed)), Ok(DiffAction::NoOp))
	}

	fn describe(&self) -> String {
		"match the desired state".to_string()
	}
}

pub fn matches_desired(desired: ManagedObject) -> MatchesDesired {
	MatchesDesired { desired }
}

/// The object is gone or was recreated under a new uid.
pub struct UidChanged {
	baseline: Option<String>,
}

impl Predicate for UidChanged {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		observed.is_none_or(|o| o.uid() != self.baseline.as_deref())
	}

	fn describe(&self) -> String {
		match &self.baseline {
			Some(uid) => format!("change uid from {uid}"),
			None => "get a uid".to_string(),
		}
	}
}

pub fn uid_changed(baseline: Option<String>) -> UidChanged {
	UidChanged { baseline }
}

pub struct DeploymentAvailable;

impl Predicate for DeploymentAvailable {
	fn holds(&self, observed: Option<&ManagedObject>) -> bool {
		observed
			.and_then(ManagedObject::as_deployment)
			.is_some_and(is_deployment_available)
	}

	fn describe(&self) -> String {
		"become available".to_string()
	}
}

pub fn deployment_available() -> DeploymentAvailable {
	DeploymentAvailable
}

/// Poll `resource` until `predicate` holds, the timeout passes or `cancel` fires.
///
/// Polls once immediately, then every `poll_interval`. Client errors other than a
/// missing object are retried until the deadline and reported with the timeout.
#[instrument(skip(client, predicate, cancel), fields(resource = %resource, expectation = %predicate.describe()))]
pub async fn wait_until<C, P>(
	client: &C,
	resource: &ResourceRef,
	predicate: P,
	options: WaitOptions,
	cancel: &CancellationToken,
) -> Result<Option<ManagedObject>, VerifyError>
where
	C: ResourceClient,
	P: Predicate,
{
	let started = Instant::now();
	let deadline = started + options.timeout;
	let cancelled = || VerifyError::Cancelled {
		resource: resource.clone(),
	};
	let mut last_error = None;

	loop {
		let polled = tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(cancelled()),
			polled = timeout_at(deadline, client.get(resource)) => polled,
		};
		match polled {
			Ok(Ok(observed)) => {
				if predicate.holds(observed.as_ref()) {
					debug!(waited = ?started.elapsed(), "condition met");
					return Ok(observed);
				}
				last_error = None;
			}
			Ok(Err(err)) => {
				debug!(error = %err, "poll failed");
				last_error = Some(err);
			}
			Err(_) => break,
		}

		let now = Instant::now();
		if now >= deadline {
			break;
		}
		tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(cancelled()),
			() = sleep_until((now + options.poll_interval).min(deadline)) => {}
		}
	}

	Err(VerifyError::Timeout {
		resource: resource.clone(),
		expectation: predicate.describe(),
		waited: started.elapsed(),
		last_error,
	})
}

/// Common waits against one client with shared options.
pub struct Verifier<'a, C> {
	client: &'a C,
	options: WaitOptions,
	cancel: CancellationToken,
}

impl<'a, C: ResourceClient> Verifier<'a, C> {
	pub fn new(client: &'a C, options: WaitOptions, cancel: CancellationToken) -> Self {
		Self {
			client,
			options,
			cancel,
		}
	}

	pub async fn wait_until_synced(
		&self,
		resource: &ResourceRef,
		desired: &ManagedObject,
	) -> Result<ManagedObject, VerifyError> {
		self.wait_for_object(resource, matches_desired(desired.clone()))
			.await
	}

	/// Wait for the object to come back under a uid other than `baseline`.
	pub async fn wait_until_recreated(
		&self,
		resource: &ResourceRef,
		baseline: Option<String>,
	) -> Result<ManagedObject, VerifyError> {
		self.wait_for_object(resource, exists().and(uid_changed(baseline)))
			.await
	}

	pub async fn wait_until_available(
		&self,
		resource: &ResourceRef,
	) -> Result<ManagedObject, VerifyError> {
		self.wait_for_object(resource, deployment_available()).await
	}

	async fn wait_for_object<P: Predicate>(
		&self,
		resource: &ResourceRef,
		predicate: P,
	) -> Result<ManagedObject, VerifyError> {
		let expectation = predicate.describe();
		let started = Instant::now();
		match wait_until(self.client, resource, predicate, self.options, &self.cancel).await? {
			Some(object) => Ok(object),
			// every predicate used here requires the object to exist
			None => Err(VerifyError::Timeout {
				resource: resource.clone(),
				expectation,
				waited: started.elapsed(),
				last_error: None,
			}),
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::{
		client::Operation,
		test_utils::{deployment, hook, validating_webhooks, Failure, MemoryClient},
	};

	fn options() -> WaitOptions {
		WaitOptions {
			timeout: Duration::from_secs(10),
			poll_interval: Duration::from_secs(1),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_returns_immediately_when_condition_holds() {
		let client = MemoryClient::default();
		let stored = client.insert(deployment("controllers", 2));
		let resource = stored.resource_ref().expect("named");

		let observed = wait_until(
			&client,
			&resource,
			deployment_available(),
			options(),
			&CancellationToken::new(),
		)
		.await
		.expect("available");
		assert_eq!(observed.as_ref().and_then(ManagedObject::uid), stored.uid());
		assert_eq!(client.calls(Operation::Get), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_times_out() {
		let client = MemoryClient::default();
		let resource = ResourceRef::validating_webhook_configuration("hooks");

		let result = wait_until(&client, &resource, exists(), options(), &CancellationToken::new()).await;
		assert_matches!(
			result,
			Err(VerifyError::Timeout { waited, last_error: None, .. }) if waited >= Duration::from_secs(10)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_absent_counts_as_uid_change() {
		let client = MemoryClient::default();
		let resource = ResourceRef::validating_webhook_configuration("hooks");

		let observed = wait_until(
			&client,
			&resource,
			uid_changed(Some("u1".to_string())),
			options(),
			&CancellationToken::new(),
		)
		.await
		.expect("absent is a change");
		assert!(observed.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn test_cancelled() {
		let client = MemoryClient::default();
		let resource = ResourceRef::validating_webhook_configuration("hooks");
		let cancel = CancellationToken::new();
		cancel.cancel();

		let result = wait_until(&client, &resource, exists(), options(), &cancel).await;
		assert_matches!(result, Err(VerifyError::Cancelled { .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn test_client_errors_are_retried() {
		let client = MemoryClient::default();
		let desired = validating_webhooks("hooks", &[hook("a.example.io", b"", &["v1"])]);
		let resource = desired.resource_ref().expect("named");
		client.insert(desired.clone());
		client.fail_next(Operation::Get, Failure::Unavailable);

		let verifier = Verifier::new(&client, options(), CancellationToken::new());
		let observed = verifier
			.wait_until_synced(&resource, &desired)
			.await
			.expect("synced after outage");
		assert_eq!(observed.name(), Some("hooks"));
		assert_eq!(client.calls(Operation::Get), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout_keeps_last_error() {
		let client = MemoryClient::default();
		let resource = ResourceRef::validating_webhook_configuration("hooks");
		for _ in 0..20 {
			client.fail_next(Operation::Get, Failure::Unavailable);
		}

		let result = wait_until(&client, &resource, exists(), options(), &CancellationToken::new()).await;
		assert_matches!(result, Err(VerifyError::Timeout { last_error: Some(ClientError::Transport { .. }), .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_until_recreated() {
		let client = MemoryClient::default();
		let original = client.insert(validating_webhooks("hooks", &[hook("a.example.io", b"", &["v1"])]));
		let resource = original.resource_ref().expect("named");
		client.remove(&resource);
		let recreated = client.insert(original.clone());

		let verifier = Verifier::new(&client, options(), CancellationToken::new());
		let observed = verifier
			.wait_until_recreated(&resource, original.uid().map(str::to_string))
			.await
			.expect("recreated");
		assert_eq!(observed.uid(), recreated.uid());
		assert_ne!(observed.uid(), original.uid());
	}
}
