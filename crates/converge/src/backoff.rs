//! Exponential backoff with jitter for retried client calls.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::{client::ClientError, config::ReconcileConfig};

/// Jittered exponential delays, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
	next: Duration,
	max: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self { next: initial, max }
	}

	pub fn from_config(config: &ReconcileConfig) -> Self {
		Self::new(config.initial_backoff, config.max_backoff)
	}

	/// Delay before the next attempt: the current step scaled by 0.5x to 1.5x.
	pub fn next_delay(&mut self) -> Duration {
		let jitter = rand::thread_rng().gen_range(0.5..1.5);
		let delay = Duration::from_secs_f64(self.next.as_secs_f64() * jitter).min(self.max);
		self.next = self.next.saturating_mul(2).min(self.max);
		delay
	}

	pub async fn wait(&mut self) {
		tokio::time::sleep(self.next_delay()).await;
	}
}

/// Run `operation`, retrying transient failures up to `transport_retries` times.
///
/// Non-transient errors are returned immediately.
pub async fn retry_transient<F, Fut, T>(
	config: &ReconcileConfig,
	operation_name: &str,
	mut operation: F,
) -> Result<T, ClientError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, ClientError>>,
{
	let mut backoff = Backoff::from_config(config);
	let mut attempt = 0u32;

	loop {
		match operation().await {
			Ok(value) => return Ok(value),
			Err(err) if err.is_transient() && attempt < config.transport_retries => {
				attempt += 1;
				let delay = backoff.next_delay();
				warn!(
					operation = %operation_name,
					attempt,
					error = %err,
					delay_ms = delay.as_millis(),
					"transient failure, retrying"
				);
				tokio::time::sleep(delay).await;
			}
			Err(err) => return Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use assert_matches::assert_matches;

	use super::*;
	use crate::{client::Operation, resource::ResourceRef};

	fn outage() -> ClientError {
		ClientError::Transport {
			resource: ResourceRef::validating_webhook_configuration("hooks"),
			operation: Operation::Get,
			source: "connection reset".into(),
		}
	}

	#[test]
	fn test_delays_grow_and_cap() {
		let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
		let first = backoff.next_delay();
		assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));
		for _ in 0..10 {
			assert!(backoff.next_delay() <= Duration::from_millis(300));
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_retries_transient_until_success() {
		let calls = AtomicU32::new(0);
		let result = retry_transient(&ReconcileConfig::default(), "get", || async {
			if calls.fetch_add(1, Ordering::SeqCst) < 2 {
				Err(outage())
			} else {
				Ok(7)
			}
		})
		.await;

		assert_eq!(result.expect("eventually succeeds"), 7);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_gives_up_after_transport_retries() {
		let calls = AtomicU32::new(0);
		let config = ReconcileConfig {
			transport_retries: 2,
			..Default::default()
		};
		let result: Result<(), _> = retry_transient(&config, "get", || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(outage())
		})
		.await;

		assert_matches!(result, Err(ClientError::Transport { .. }));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_non_transient_is_not_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_transient(&ReconcileConfig::default(), "get", || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(ClientError::NotFound {
				resource: ResourceRef::validating_webhook_configuration("hooks"),
			})
		})
		.await;

		assert_matches!(result, Err(ClientError::NotFound { .. }));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
