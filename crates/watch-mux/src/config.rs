//! Multiplexer configuration

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
	channel::{ChannelConfig, OverflowPolicy},
	Error,
};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_MAX_WATCHES: usize = 8192;
pub const DEFAULT_SOURCE_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
	/// Capacity of each subscriber channel unless the activation overrides it
	pub channel_capacity: usize,
	/// What to do when a subscriber channel is full
	pub overflow_policy: OverflowPolicy,
	/// Only used by [`OverflowPolicy::BlockWithTimeout`]
	pub block_timeout_ms: u64,
	/// First delay before retrying a failed watch source
	pub backoff_initial_ms: u64,
	/// Retry delays double up to this ceiling
	pub backoff_max_ms: u64,
	/// Cap on distinct watched directories, below whatever the OS enforces
	pub max_watches: usize,
	/// Raw event batches the backend may queue ahead of the dispatch loop before they turn
	/// into an overflow
	pub source_queue_capacity: usize,
	pub dispatch_thread_name: String,
}

impl Default for MuxConfig {
	fn default() -> Self {
		Self {
			channel_capacity: DEFAULT_CHANNEL_CAPACITY,
			overflow_policy: OverflowPolicy::DropOldest,
			block_timeout_ms: 100,
			backoff_initial_ms: 100,
			backoff_max_ms: 30_000,
			max_watches: DEFAULT_MAX_WATCHES,
			source_queue_capacity: DEFAULT_SOURCE_QUEUE_CAPACITY,
			dispatch_thread_name: "watch-dispatch".to_string(),
		}
	}
}

impl MuxConfig {
	/// Load configuration from a JSON file, missing fields take their defaults
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();
		info!("Loading watch multiplexer config from {}", path.display());
		let json = fs::read_to_string(path)?;
		Ok(serde_json::from_str(&json)?)
	}

	#[must_use]
	pub fn channel_config(&self) -> ChannelConfig {
		ChannelConfig {
			capacity: self.channel_capacity,
			policy: self.overflow_policy,
			block_timeout: Duration::from_millis(self.block_timeout_ms),
		}
	}

	#[must_use]
	pub const fn backoff_initial(&self) -> Duration {
		Duration::from_millis(self.backoff_initial_ms)
	}

	#[must_use]
	pub const fn backoff_max(&self) -> Duration {
		Duration::from_millis(self.backoff_max_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::io::Write;

	use tempfile::NamedTempFile;

	#[test]
	fn partial_file_keeps_defaults() {
		let mut file = NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{ "channel_capacity": 8, "overflow_policy": "block_with_timeout" }}"#
		)
		.unwrap();

		let config = MuxConfig::load_from(file.path()).unwrap();
		assert_eq!(config.channel_capacity, 8);
		assert_eq!(config.overflow_policy, OverflowPolicy::BlockWithTimeout);
		assert_eq!(config.max_watches, DEFAULT_MAX_WATCHES);
		assert_eq!(config.source_queue_capacity, DEFAULT_SOURCE_QUEUE_CAPACITY);
		assert_eq!(config.dispatch_thread_name, "watch-dispatch");

		let channel = config.channel_config();
		assert_eq!(channel.capacity, 8);
		assert_eq!(channel.block_timeout, Duration::from_millis(100));
	}

	#[test]
	fn malformed_file_is_a_config_error() {
		let mut file = NamedTempFile::new().unwrap();
		write!(file, r#"{{ "overflow_policy": "sometimes" }}"#).unwrap();

		assert!(matches!(
			MuxConfig::load_from(file.path()),
			Err(Error::Config(_))
		));
	}

	#[test]
	fn missing_file_is_an_io_error() {
		let dir = tempfile::tempdir().unwrap();
		assert!(matches!(
			MuxConfig::load_from(dir.path().join("nope.json")),
			Err(Error::Io(_))
		));
	}
}
