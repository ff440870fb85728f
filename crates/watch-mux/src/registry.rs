//! Routing table from watch tokens to the subscriptions interested in them
//!
//! Writers (register/unregister) are serialized by the membership lock, which is held across the
//! call into the watch source so that the last unregistration of a token and a new registration of
//! the same directory can't interleave. Readers only ever take the routes lock long enough to
//! clone an `Arc`, the per token lists are replaced wholesale on every change.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace};

use crate::{
	channel::EventSender, metrics::MuxMetrics, source::WatchSource, Error, EventKinds, HandlerRef,
	SubscriptionId, WatchToken,
};

#[derive(Debug, Clone)]
pub struct Subscription {
	pub id: SubscriptionId,
	pub token: WatchToken,
	/// The watched directory as resolved by the backend
	pub path: PathBuf,
	pub kinds: EventKinds,
	pub handler: HandlerRef,
	destination: EventSender,
}

impl Subscription {
	#[must_use]
	pub const fn destination(&self) -> &EventSender {
		&self.destination
	}
}

#[derive(Debug, Default)]
struct Membership {
	tokens: HashMap<SubscriptionId, WatchToken>,
	closed: bool,
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
	source: Arc<WatchSource>,
	membership: Mutex<Membership>,
	routes: RwLock<HashMap<WatchToken, Arc<[Subscription]>>>,
	metrics: Arc<MuxMetrics>,
}

impl SubscriptionRegistry {
	pub fn new(source: Arc<WatchSource>, metrics: Arc<MuxMetrics>) -> Self {
		Self {
			source,
			membership: Mutex::default(),
			routes: RwLock::default(),
			metrics,
		}
	}

	#[instrument(skip_all, fields(path = %path.display(), ?kinds))]
	pub fn register(
		&self,
		path: &Path,
		kinds: EventKinds,
		handler: impl Into<HandlerRef>,
		destination: EventSender,
	) -> Result<Subscription, Error> {
		if kinds.is_empty() {
			return Err(Error::EmptyKindFilter);
		}

		let mut membership = self.membership.lock();
		if membership.closed {
			return Err(Error::Closed);
		}

		let token = self.source.register(path)?;

		let subscription = Subscription {
			id: SubscriptionId::next(),
			token,
			path: self
				.source
				.path_of(token)
				.unwrap_or_else(|| path.to_path_buf()),
			kinds,
			handler: handler.into(),
			destination,
		};

		{
			let mut routes = self.routes.write();
			let updated = routes
				.get(&token)
				.into_iter()
				.flat_map(|existing| existing.iter().cloned())
				.chain([subscription.clone()])
				.collect::<Arc<[_]>>();
			routes.insert(token, updated);

			membership.tokens.insert(subscription.id, token);
			self.metrics
				.update_active(membership.tokens.len(), routes.len());
		}

		debug!(
			id = %subscription.id,
			%token,
			handler = %subscription.handler,
			"Subscription registered",
		);

		Ok(subscription)
	}

	/// Returns `false` for ids that aren't registered (anymore).
	pub fn unregister(&self, id: SubscriptionId) -> bool {
		let mut membership = self.membership.lock();

		let Some(token) = membership.tokens.remove(&id) else {
			trace!(%id, "Subscription already gone");
			return false;
		};

		let (removed, last) = {
			let mut routes = self.routes.write();

			let Some(existing) = routes.remove(&token) else {
				return false;
			};

			let (removed, kept): (Vec<_>, Vec<_>) =
				existing.iter().cloned().partition(|sub| sub.id == id);

			let last = kept.is_empty();
			if !last {
				routes.insert(token, kept.into());
			}

			self.metrics
				.update_active(membership.tokens.len(), routes.len());

			(removed, last)
		};

		for subscription in &removed {
			subscription.destination.close();
		}

		if last {
			self.source.unregister(token);
		}

		debug!(%id, %token, last, "Subscription unregistered");

		true
	}

	/// Subscriptions on `token` in registration order, a cheap snapshot
	#[must_use]
	pub fn lookup(&self, token: WatchToken) -> Arc<[Subscription]> {
		self.routes
			.read()
			.get(&token)
			.cloned()
			.unwrap_or_else(|| Arc::from(Vec::new()))
	}

	/// Tokens with at least one live subscription
	#[must_use]
	pub fn active_tokens(&self) -> Vec<WatchToken> {
		let mut tokens = self.routes.read().keys().copied().collect::<Vec<_>>();
		tokens.sort_unstable();
		tokens
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.membership.lock().tokens.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Closes every destination channel, later registrations fail with [`Error::Closed`].
	pub fn close_all(&self) {
		let mut membership = self.membership.lock();
		membership.closed = true;
		membership.tokens.clear();

		let routes = std::mem::take(&mut *self.routes.write());
		let mut closed = 0;
		for subscription in routes.values().flat_map(|subscriptions| subscriptions.iter()) {
			subscription.destination.close();
			closed += 1;
		}

		self.metrics.update_active(0, 0);

		debug!(closed, "Closed every subscriber channel");
	}
}
