//! The dispatch thread: pulls raw events from the watch source and routes them

use std::{
	sync::Arc,
	thread::{self, JoinHandle},
};

use tokio::{runtime, spawn};
use tracing::{debug, error, trace, warn};

use crate::{
	channel::Offer, metrics::MuxMetrics, registry::SubscriptionRegistry, source::WatchSource,
	supervisor::Lifecycle, DeliveredEvent, Error, EventKind, RawEvent,
};

#[derive(Debug, Clone)]
pub(crate) struct DispatchLoop {
	source: Arc<WatchSource>,
	registry: Arc<SubscriptionRegistry>,
	lifecycle: Arc<Lifecycle>,
}

impl DispatchLoop {
	pub(crate) const fn new(
		source: Arc<WatchSource>,
		registry: Arc<SubscriptionRegistry>,
		lifecycle: Arc<Lifecycle>,
	) -> Self {
		Self {
			source,
			registry,
			lifecycle,
		}
	}

	/// Runs the loop on its own OS thread until the watch source is closed.
	pub(crate) fn spawn(self, name: &str) -> Result<JoinHandle<()>, Error> {
		let runtime = runtime::Builder::new_current_thread()
			.enable_time()
			.build()?;

		let handle = thread::Builder::new()
			.name(name.to_string())
			.spawn(move || {
				runtime.block_on(self.supervise());
				debug!("Dispatch thread finished");
			})?;

		Ok(handle)
	}

	async fn supervise(self) {
		while let Err(e) = spawn({
			let this = self.clone();
			async move { this.run().await }
		})
		.await
		{
			if e.is_panic() {
				error!(?e, "Dispatch loop panicked, restarting;");
				self.lifecycle.metrics.record_dispatch_restart();
			} else {
				break;
			}
		}
	}

	async fn run(&self) {
		loop {
			match self.source.next().await {
				Ok(event) => self.dispatch(event).await,

				Err(Error::SourceUnavailable(reason)) => {
					self.lifecycle.recover(&self.source, reason).await;
				}

				Err(Error::Closed) => {
					debug!("Watch source closed, dispatch loop exiting");
					break;
				}

				Err(e) => error!(?e, "Unexpected error from watch source;"),
			}
		}
	}

	async fn dispatch(&self, event: RawEvent) {
		let metrics = &self.lifecycle.metrics;
		metrics.record_event_received();

		let subscriptions = self.registry.lookup(event.token);
		if subscriptions.is_empty() {
			trace!(token = %event.token, seq = event.seq, "No subscription for event");
			return;
		}

		let resync = event.kind == EventKind::Overflow;

		for subscription in subscriptions.iter() {
			if !subscription.kinds.accepts(event.kind) {
				metrics.record_event_filtered();
				continue;
			}

			let delivered = DeliveredEvent::from_raw(subscription.id, &subscription.path, &event);
			let destination = subscription.destination();

			let offer = if resync {
				destination.resync(delivered)
			} else {
				destination.offer(delivered).await
			};

			trace!(
				id = %subscription.id,
				token = %event.token,
				kind = ?event.kind,
				seq = event.seq,
				?offer,
				"Dispatched event",
			);

			record_offer(metrics, offer, resync);

			if offer.dropped() {
				warn!(
					id = %subscription.id,
					handler = %subscription.handler,
					?offer,
					queued = destination.len(),
					"Subscriber channel full, event dropped;"
				);
			}
		}
	}
}

fn record_offer(metrics: &MuxMetrics, offer: Offer, resync: bool) {
	match offer {
		Offer::Delivered => metrics.record_event_delivered(),
		Offer::DroppedOldest => {
			metrics.record_event_delivered();
			metrics.record_event_dropped();
		}
		Offer::DroppedNewest | Offer::TimedOut => metrics.record_event_dropped(),
		Offer::Collapsed => {
			metrics.record_overflow_collapsed();
			return;
		}
		// consumer gone, not a drop
		Offer::Closed => return,
	}

	// resyncs always get in, they are never the dropped event
	if resync {
		metrics.record_resync_delivered();
	}
}
