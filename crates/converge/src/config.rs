//! Reconciler tuning knobs.
//!
//! Every field has a default, so a config file only needs the values it changes.
//! Durations are written as integer milliseconds:
//!
//! ```yaml
//! maxConflictRetries: 8
//! resyncInterval: 60000
//! ```

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verify::WaitOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}")]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ReconcileConfig {
	/// Fetch-diff-write reruns after a resourceVersion conflict.
	pub max_conflict_retries: u32,
	/// Retries of a single call failing with a transport error.
	pub transport_retries: u32,
	#[serde(with = "millis")]
	pub initial_backoff: Duration,
	#[serde(with = "millis")]
	pub max_backoff: Duration,
	/// Period of the full resync in the long-running loop.
	#[serde(with = "millis")]
	pub resync_interval: Duration,
	#[serde(with = "millis")]
	pub verify_timeout: Duration,
	#[serde(with = "millis")]
	pub verify_poll_interval: Duration,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self {
			max_conflict_retries: 5,
			transport_retries: 3,
			initial_backoff: Duration::from_millis(100),
			max_backoff: Duration::from_secs(5),
			resync_interval: Duration::from_secs(30),
			verify_timeout: Duration::from_secs(120),
			verify_poll_interval: Duration::from_secs(2),
		}
	}
}

impl ReconcileConfig {
	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
		// an empty file is a valid config
		if content.trim().is_empty() {
			return Ok(Self::default());
		}
		serde_yaml::from_str(content)
	}

	pub fn wait_options(&self) -> WaitOptions {
		WaitOptions {
			timeout: self.verify_timeout,
			poll_interval: self.verify_poll_interval,
		}
	}
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
