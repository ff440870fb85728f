//! Metrics and observability for the watch multiplexer

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct MuxMetrics {
	/// Raw events pulled from the watch source
	pub events_received: AtomicU64,
	/// Events placed on a subscriber channel, including those that evicted an older one
	pub events_delivered: AtomicU64,
	/// Events skipped by a subscription's kind filter
	pub events_filtered: AtomicU64,
	/// Events lost to a full subscriber channel
	pub events_dropped: AtomicU64,
	/// Resync notifications delivered
	pub resyncs_delivered: AtomicU64,
	/// Overflows folded into a resync that was already delivered
	pub overflows_collapsed: AtomicU64,
	/// Times the watch source reported itself unavailable
	pub source_failures: AtomicU64,
	/// Times the watch source was successfully reopened
	pub source_restarts: AtomicU64,
	/// Times the dispatch loop was restarted after a panic
	pub dispatch_restarts: AtomicU64,
	pub active_subscriptions: AtomicU64,
	pub active_watches: AtomicU64,
}

/// Point in time copy of [`MuxMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
	pub events_received: u64,
	pub events_delivered: u64,
	pub events_filtered: u64,
	pub events_dropped: u64,
	pub resyncs_delivered: u64,
	pub overflows_collapsed: u64,
	pub source_failures: u64,
	pub source_restarts: u64,
	pub dispatch_restarts: u64,
	pub active_subscriptions: u64,
	pub active_watches: u64,
}

impl MuxMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_event_received(&self) {
		self.events_received.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_event_delivered(&self) {
		self.events_delivered.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_event_filtered(&self) {
		self.events_filtered.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_event_dropped(&self) {
		self.events_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_resync_delivered(&self) {
		self.resyncs_delivered.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_overflow_collapsed(&self) {
		self.overflows_collapsed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_source_failure(&self) {
		self.source_failures.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_source_restart(&self) {
		self.source_restarts.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_dispatch_restart(&self) {
		self.dispatch_restarts.fetch_add(1, Ordering::Relaxed);
	}

	pub fn update_active(&self, subscriptions: usize, watches: usize) {
		self.active_subscriptions
			.store(subscriptions as u64, Ordering::Relaxed);
		self.active_watches.store(watches as u64, Ordering::Relaxed);
	}

	/// Percentage of delivery attempts that lost an event
	pub fn get_drop_rate(&self) -> f64 {
		let delivered = self.events_delivered.load(Ordering::Relaxed);
		let dropped = self.events_dropped.load(Ordering::Relaxed);
		let attempts = delivered + dropped;

		if attempts == 0 {
			0.0
		} else {
			(dropped as f64 / attempts as f64) * 100.0
		}
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			events_received: self.events_received.load(Ordering::Relaxed),
			events_delivered: self.events_delivered.load(Ordering::Relaxed),
			events_filtered: self.events_filtered.load(Ordering::Relaxed),
			events_dropped: self.events_dropped.load(Ordering::Relaxed),
			resyncs_delivered: self.resyncs_delivered.load(Ordering::Relaxed),
			overflows_collapsed: self.overflows_collapsed.load(Ordering::Relaxed),
			source_failures: self.source_failures.load(Ordering::Relaxed),
			source_restarts: self.source_restarts.load(Ordering::Relaxed),
			dispatch_restarts: self.dispatch_restarts.load(Ordering::Relaxed),
			active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
			active_watches: self.active_watches.load(Ordering::Relaxed),
		}
	}

	pub fn log_metrics(&self) {
		info!(
			"Watch multiplexer metrics: received={}, delivered={}, filtered={}, dropped={}, drop_rate={:.2}%, resyncs={}, source_failures={}, source_restarts={}, subscriptions={}, watches={}",
			self.events_received.load(Ordering::Relaxed),
			self.events_delivered.load(Ordering::Relaxed),
			self.events_filtered.load(Ordering::Relaxed),
			self.events_dropped.load(Ordering::Relaxed),
			self.get_drop_rate(),
			self.resyncs_delivered.load(Ordering::Relaxed),
			self.source_failures.load(Ordering::Relaxed),
			self.source_restarts.load(Ordering::Relaxed),
			self.active_subscriptions.load(Ordering::Relaxed),
			self.active_watches.load(Ordering::Relaxed)
		);
	}
}
