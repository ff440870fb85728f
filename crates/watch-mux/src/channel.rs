//! Bounded per-subscription queues between the dispatch loop and consumers
//!
//! The sending half keeps a receiver of its own so it can evict the oldest queued event when
//! the consumer falls behind, and so it can discard whatever is pending when the channel closes.
//! Both halves share a count of queued resyncs so a resync is only collapsed into one the
//! consumer hasn't taken yet.

use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel::{self as chan, TrySendError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::{config::DEFAULT_CHANNEL_CAPACITY, DeliveredEvent, Error};

/// Behaviour of [`EventSender::offer`] on a full channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Evict the oldest queued event to make room
	#[default]
	DropOldest,
	/// Discard the event being offered
	DropNewest,
	/// Wait for room, up to [`ChannelConfig::block_timeout`]
	BlockWithTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
	pub capacity: usize,
	pub policy: OverflowPolicy,
	pub block_timeout: Duration,
}

impl Default for ChannelConfig {
	fn default() -> Self {
		Self {
			capacity: DEFAULT_CHANNEL_CAPACITY,
			policy: OverflowPolicy::DropOldest,
			block_timeout: Duration::from_millis(100),
		}
	}
}

/// Outcome of offering an event to a subscriber channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
	Delivered,
	/// Delivered after evicting the oldest queued event
	DroppedOldest,
	/// The offered event was discarded
	DroppedNewest,
	/// No room appeared before the block timeout, the offered event was discarded
	TimedOut,
	/// A resync the consumer hasn't taken yet already ends the queue, nothing was pushed
	Collapsed,
	/// The channel is closed or nobody is listening anymore
	Closed,
}

impl Offer {
	#[must_use]
	pub const fn dropped(self) -> bool {
		matches!(self, Self::DroppedOldest | Self::DroppedNewest | Self::TimedOut)
	}
}

/// Resyncs sitting in one channel
#[derive(Debug, Default)]
struct QueuedResyncs {
	/// Pushed and neither taken by the consumer nor evicted
	count: AtomicUsize,
	/// The last event pushed was a resync
	at_tail: AtomicBool,
}

impl QueuedResyncs {
	fn pending(&self) -> bool {
		self.at_tail.load(Ordering::Acquire) && self.count.load(Ordering::Acquire) > 0
	}

	// counted before the push, the consumer may take it right away
	fn pushing(&self) {
		self.count.fetch_add(1, Ordering::AcqRel);
		self.at_tail.store(true, Ordering::Release);
	}

	fn pushed_other(&self) {
		self.at_tail.store(false, Ordering::Release);
	}

	fn removed(&self, event: &DeliveredEvent) {
		if event.is_resync() {
			// resyncs pushed through `offer` by a caller holding the sender were never counted
			let _ = self
				.count
				.try_update(Ordering::AcqRel, Ordering::Acquire, |count| {
					count.checked_sub(1)
				});
		}
	}

	fn clear(&self) {
		self.count.store(0, Ordering::Release);
		self.at_tail.store(false, Ordering::Release);
	}
}

#[must_use]
pub fn channel(config: ChannelConfig) -> (EventSender, EventReceiver) {
	let (tx, rx) = chan::bounded(config.capacity.max(1));
	let resyncs = Arc::new(QueuedResyncs::default());

	(
		EventSender {
			tx,
			evict: rx.clone(),
			resyncs: Arc::clone(&resyncs),
			policy: config.policy,
			block_timeout: config.block_timeout,
		},
		EventReceiver { rx, resyncs },
	)
}

#[derive(Debug, Clone)]
pub struct EventSender {
	tx: chan::Sender<DeliveredEvent>,
	evict: chan::Receiver<DeliveredEvent>,
	resyncs: Arc<QueuedResyncs>,
	policy: OverflowPolicy,
	block_timeout: Duration,
}

impl EventSender {
	/// Never blocks longer than the channel's policy allows.
	pub async fn offer(&self, event: DeliveredEvent) -> Offer {
		if self.is_abandoned() {
			return Offer::Closed;
		}

		let offer = match self.tx.try_send(event) {
			Ok(()) => Offer::Delivered,
			Err(TrySendError::Closed(_)) => Offer::Closed,
			Err(TrySendError::Full(event)) => match self.policy {
				OverflowPolicy::DropOldest => self.evict_and_push(event),
				OverflowPolicy::DropNewest => Offer::DroppedNewest,
				OverflowPolicy::BlockWithTimeout => {
					match timeout(self.block_timeout, self.tx.send(event)).await {
						Ok(Ok(())) => Offer::Delivered,
						Ok(Err(_)) => Offer::Closed,
						Err(_) => Offer::TimedOut,
					}
				}
			},
		};

		if matches!(offer, Offer::Delivered | Offer::DroppedOldest) {
			self.resyncs.pushed_other();
		}

		offer
	}

	/// Queues a resync regardless of policy, evicting the oldest event when full.
	///
	/// Collapses into the resync at the end of the queue if the consumer hasn't taken it yet:
	/// whatever it rescans once it does covers this one too.
	pub fn resync(&self, event: DeliveredEvent) -> Offer {
		if self.is_abandoned() {
			return Offer::Closed;
		}

		if self.resyncs.pending() {
			return Offer::Collapsed;
		}

		self.resyncs.pushing();
		match self.tx.try_send(event) {
			Ok(()) => Offer::Delivered,
			Err(TrySendError::Closed(_)) => Offer::Closed,
			Err(TrySendError::Full(event)) => self.evict_and_push(event),
		}
	}

	fn evict_and_push(&self, mut event: DeliveredEvent) -> Offer {
		let mut evicted = false;
		loop {
			// the consumer may take concurrently, so only count what we actually removed
			if let Ok(oldest) = self.evict.try_recv() {
				self.resyncs.removed(&oldest);
				evicted = true;
			}

			match self.tx.try_send(event) {
				Ok(()) if evicted => return Offer::DroppedOldest,
				Ok(()) => return Offer::Delivered,
				Err(TrySendError::Full(returned)) => event = returned,
				Err(TrySendError::Closed(_)) => return Offer::Closed,
			}
		}
	}

	/// Every consumer-side receiver was dropped, only our eviction handle remains
	fn is_abandoned(&self) -> bool {
		self.tx.receiver_count() <= 1
	}

	/// Closes the channel and discards pending events, consumers observe [`Error::Closed`].
	pub fn close(&self) {
		self.tx.close();
		while self.evict.try_recv().is_ok() {}
		self.resyncs.clear();
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.tx.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.tx.is_empty()
	}
}

#[derive(Debug, Clone)]
pub struct EventReceiver {
	rx: chan::Receiver<DeliveredEvent>,
	resyncs: Arc<QueuedResyncs>,
}

impl EventReceiver {
	/// Blocks the current thread until an event arrives or the channel is closed.
	///
	/// Must not be called from inside an async task, use [`EventReceiver::recv`] there.
	pub fn take(&self) -> Result<DeliveredEvent, Error> {
		self.rx
			.recv_blocking()
			.map(|event| self.taken(event))
			.map_err(|_| Error::Closed)
	}

	pub async fn recv(&self) -> Result<DeliveredEvent, Error> {
		self.rx
			.recv()
			.await
			.map(|event| self.taken(event))
			.map_err(|_| Error::Closed)
	}

	/// `Ok(None)` when nothing is queued yet
	pub fn try_take(&self) -> Result<Option<DeliveredEvent>, Error> {
		match self.rx.try_recv() {
			Ok(event) => Ok(Some(self.taken(event))),
			Err(chan::TryRecvError::Empty) => Ok(None),
			Err(chan::TryRecvError::Closed) => Err(Error::Closed),
		}
	}

	fn taken(&self, event: DeliveredEvent) -> DeliveredEvent {
		self.resyncs.removed(&event);
		event
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.rx.is_closed()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.rx.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}

	pub fn into_stream(self) -> impl Stream<Item = DeliveredEvent> {
		let resyncs = self.resyncs;
		self.rx.inspect(move |event| resyncs.removed(event))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::path::PathBuf;

	use crate::{EventKind, SubscriptionId};

	fn event(seq: u64) -> DeliveredEvent {
		DeliveredEvent {
			subscription: SubscriptionId::next(),
			path: PathBuf::from(format!("/tmp/a/{seq}")),
			kind: EventKind::Created,
			seq,
		}
	}

	fn config(capacity: usize, policy: OverflowPolicy) -> ChannelConfig {
		ChannelConfig {
			capacity,
			policy,
			block_timeout: Duration::from_millis(20),
		}
	}

	#[tokio::test]
	async fn drop_oldest_keeps_latest() {
		let (tx, rx) = channel(config(2, OverflowPolicy::DropOldest));

		assert_eq!(tx.offer(event(0)).await, Offer::Delivered);
		assert_eq!(tx.offer(event(1)).await, Offer::Delivered);
		assert_eq!(tx.offer(event(2)).await, Offer::DroppedOldest);

		assert_eq!(rx.try_take().unwrap().unwrap().seq, 1);
		assert_eq!(rx.try_take().unwrap().unwrap().seq, 2);
		assert_eq!(rx.try_take().unwrap(), None);
	}

	#[tokio::test]
	async fn drop_newest_keeps_earliest() {
		let (tx, rx) = channel(config(1, OverflowPolicy::DropNewest));

		assert_eq!(tx.offer(event(0)).await, Offer::Delivered);
		assert_eq!(tx.offer(event(1)).await, Offer::DroppedNewest);

		assert_eq!(rx.recv().await.unwrap().seq, 0);
		assert!(rx.is_empty());
	}

	#[tokio::test]
	async fn block_with_timeout_gives_up() {
		let (tx, rx) = channel(config(1, OverflowPolicy::BlockWithTimeout));

		assert_eq!(tx.offer(event(0)).await, Offer::Delivered);
		assert_eq!(tx.offer(event(1)).await, Offer::TimedOut);
		assert_eq!(rx.len(), 1);
	}

	#[tokio::test]
	async fn block_with_timeout_waits_for_room() {
		let (tx, rx) = channel(ChannelConfig {
			block_timeout: Duration::from_secs(5),
			..config(1, OverflowPolicy::BlockWithTimeout)
		});

		assert_eq!(tx.offer(event(0)).await, Offer::Delivered);

		let consumer = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			let first = rx.recv().await.unwrap();
			let second = rx.recv().await.unwrap();
			(first.seq, second.seq)
		});

		assert_eq!(tx.offer(event(1)).await, Offer::Delivered);
		assert_eq!(consumer.await.unwrap(), (0, 1));
	}

	fn resync(seq: u64) -> DeliveredEvent {
		DeliveredEvent {
			path: PathBuf::from("/tmp/a"),
			kind: EventKind::Overflow,
			..event(seq)
		}
	}

	#[tokio::test]
	async fn resync_ignores_drop_newest() {
		let (tx, rx) = channel(config(1, OverflowPolicy::DropNewest));

		assert_eq!(tx.offer(event(0)).await, Offer::Delivered);
		assert_eq!(tx.resync(resync(1)), Offer::DroppedOldest);
		assert_eq!(rx.try_take().unwrap().unwrap().seq, 1);
	}

	#[tokio::test]
	async fn resync_collapses_only_while_untaken() {
		let (tx, rx) = channel(config(8, OverflowPolicy::DropOldest));

		assert_eq!(tx.resync(resync(0)), Offer::Delivered);
		assert_eq!(tx.resync(resync(1)), Offer::Collapsed);
		assert_eq!(rx.len(), 1);

		assert!(rx.try_take().unwrap().unwrap().is_resync());
		assert_eq!(tx.resync(resync(2)), Offer::Delivered);
		assert_eq!(rx.recv().await.unwrap().seq, 2);

		// a change after the queued resync needs a resync of its own
		assert_eq!(tx.resync(resync(3)), Offer::Delivered);
		assert_eq!(tx.offer(event(4)).await, Offer::Delivered);
		assert_eq!(tx.resync(resync(5)), Offer::Delivered);
		assert_eq!(tx.resync(resync(6)), Offer::Collapsed);

		let seqs = rx
			.clone()
			.into_stream()
			.take(3)
			.map(|event| event.seq)
			.collect::<Vec<_>>()
			.await;
		assert_eq!(seqs, [3, 4, 5]);
		assert_eq!(tx.resync(resync(7)), Offer::Delivered);
	}

	#[tokio::test]
	async fn evicted_resync_is_not_collapsed_into() {
		let (tx, rx) = channel(config(1, OverflowPolicy::DropOldest));

		assert_eq!(tx.resync(resync(0)), Offer::Delivered);
		assert_eq!(tx.offer(event(1)).await, Offer::DroppedOldest);
		assert_eq!(tx.resync(resync(2)), Offer::DroppedOldest);

		assert_eq!(rx.try_take().unwrap().unwrap().seq, 2);
		assert_eq!(rx.try_take().unwrap(), None);
	}

	#[tokio::test]
	async fn close_discards_pending() {
		let (tx, rx) = channel(config(4, OverflowPolicy::DropOldest));

		tx.offer(event(0)).await;
		tx.offer(event(1)).await;
		tx.close();

		assert!(rx.is_closed());
		assert!(matches!(rx.try_take(), Err(Error::Closed)));
		assert!(matches!(rx.recv().await, Err(Error::Closed)));
		assert_eq!(tx.offer(event(2)).await, Offer::Closed);
	}

	#[tokio::test]
	async fn abandoned_channel_reports_closed() {
		let (tx, rx) = channel(config(1, OverflowPolicy::DropOldest));
		drop(rx);

		assert_eq!(tx.offer(event(0)).await, Offer::Closed);
		assert!(tx.is_empty());
	}

	#[test]
	fn zero_capacity_is_clamped() {
		let (tx, rx) = channel(config(0, OverflowPolicy::DropNewest));
		assert_eq!(tx.resync(resync(0)), Offer::Delivered);
		assert_eq!(rx.take().unwrap().seq, 0);
	}
}
