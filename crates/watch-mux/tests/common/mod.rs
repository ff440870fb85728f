#![allow(dead_code)]

use std::time::Duration;

use sd_watch_mux::{
	manual_backend, DeliveredEvent, ManualHandle, MuxConfig, Subscriber, WatchMultiplexer,
};
use tokio::time::{sleep, timeout};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> MuxConfig {
	MuxConfig {
		backoff_initial_ms: 10,
		backoff_max_ms: 40,
		dispatch_thread_name: "watch-dispatch-test".to_string(),
		..Default::default()
	}
}

pub fn started_mux(config: MuxConfig) -> (WatchMultiplexer, ManualHandle) {
	let (factory, handle) = manual_backend();
	let mux = WatchMultiplexer::with_backend(config, factory);
	mux.on_start().unwrap();
	(mux, handle)
}

pub async fn next_event(subscriber: &Subscriber) -> DeliveredEvent {
	timeout(TIMEOUT, subscriber.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("subscriber channel closed")
}

/// Polls `condition` until it holds, panicking after [`TIMEOUT`]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	timeout(TIMEOUT, async {
		while !condition() {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition never held");
}
