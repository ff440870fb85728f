//! Host-facing facade over the supervisor and the subscription registry

use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use futures::Stream;
use tracing::{debug, trace};

use crate::{
	backend::{BackendFactory, NotifyFactory},
	channel::{channel, EventReceiver, EventSender, OverflowPolicy},
	config::MuxConfig,
	registry::SubscriptionRegistry,
	supervisor::{Health, Supervisor, SupervisorState},
	DeliveredEvent, Error, EventKinds, HandlerRef, SubscriptionId, WatchToken,
};

/// What a host asks for when it activates an endpoint on a directory
#[derive(Debug, Clone)]
pub struct Activation {
	path: PathBuf,
	kinds: EventKinds,
	handler: HandlerRef,
	capacity: Option<usize>,
	policy: Option<OverflowPolicy>,
	block_timeout: Option<Duration>,
}

impl Activation {
	pub fn new(path: impl Into<PathBuf>, kinds: EventKinds) -> Self {
		Self {
			path: path.into(),
			kinds,
			handler: HandlerRef::default(),
			capacity: None,
			policy: None,
			block_timeout: None,
		}
	}

	#[must_use]
	pub fn handler(mut self, handler: impl Into<HandlerRef>) -> Self {
		self.handler = handler.into();
		self
	}

	#[must_use]
	pub const fn capacity(mut self, capacity: usize) -> Self {
		self.capacity = Some(capacity);
		self
	}

	#[must_use]
	pub const fn policy(mut self, policy: OverflowPolicy) -> Self {
		self.policy = Some(policy);
		self
	}

	#[must_use]
	pub const fn block_timeout(mut self, block_timeout: Duration) -> Self {
		self.block_timeout = Some(block_timeout);
		self
	}
}

/// Identifies an activation for [`WatchMultiplexer::on_deactivate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
	pub id: SubscriptionId,
	pub token: WatchToken,
}

/// Consumer end of an activation
#[derive(Debug)]
pub struct Subscriber {
	handle: SubscriptionHandle,
	path: PathBuf,
	receiver: EventReceiver,
}

impl Subscriber {
	/// Blocks the calling thread until the next event, [`Error::Closed`] once deactivated or stopped.
	pub fn take(&self) -> Result<DeliveredEvent, Error> {
		self.receiver.take()
	}

	pub async fn recv(&self) -> Result<DeliveredEvent, Error> {
		self.receiver.recv().await
	}

	pub fn try_take(&self) -> Result<Option<DeliveredEvent>, Error> {
		self.receiver.try_take()
	}

	#[must_use]
	pub const fn handle(&self) -> SubscriptionHandle {
		self.handle
	}

	/// The watched directory as the backend resolved it
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	#[must_use]
	pub fn into_receiver(self) -> EventReceiver {
		self.receiver
	}

	pub fn into_stream(self) -> impl Stream<Item = DeliveredEvent> {
		self.receiver.into_stream()
	}
}

/// Host facing side of the multiplexer
///
/// Maps the host's lifecycle calls onto the supervisor and the subscription registry. Dropping it
/// stops everything that is still running.
#[derive(Debug)]
pub struct WatchMultiplexer {
	supervisor: Supervisor,
}

impl WatchMultiplexer {
	/// Backed by the platform's native watcher
	#[must_use]
	pub fn new(config: MuxConfig) -> Self {
		Self::with_backend(config, NotifyFactory)
	}

	pub fn with_backend(config: MuxConfig, factory: impl BackendFactory + 'static) -> Self {
		Self {
			supervisor: Supervisor::new(config, Arc::new(factory)),
		}
	}

	pub fn on_start(&self) -> Result<(), Error> {
		self.supervisor.start()
	}

	pub fn on_stop(&self) -> Result<(), Error> {
		self.supervisor.stop()
	}

	/// Subscribes to `activation`'s directory through a fresh channel.
	pub fn on_activate(&self, activation: Activation) -> Result<Subscriber, Error> {
		let Activation {
			path,
			kinds,
			handler,
			capacity,
			policy,
			block_timeout,
		} = activation;

		let mut config = self.supervisor.config().channel_config();
		if let Some(capacity) = capacity {
			config.capacity = capacity;
		}
		if let Some(policy) = policy {
			config.policy = policy;
		}
		if let Some(block_timeout) = block_timeout {
			config.block_timeout = block_timeout;
		}

		let (sender, receiver) = channel(config);

		let subscription = self
			.supervisor
			.registry()?
			.register(&path, kinds, handler, sender)?;

		Ok(Subscriber {
			handle: SubscriptionHandle {
				id: subscription.id,
				token: subscription.token,
			},
			path: subscription.path,
			receiver,
		})
	}

	/// Subscribes with a channel the caller created.
	pub fn on_activate_with(
		&self,
		path: impl AsRef<Path>,
		kinds: EventKinds,
		handler: impl Into<HandlerRef>,
		destination: EventSender,
	) -> Result<SubscriptionHandle, Error> {
		let subscription = self.supervisor.registry()?.register(
			path.as_ref(),
			kinds,
			handler,
			destination,
		)?;

		Ok(SubscriptionHandle {
			id: subscription.id,
			token: subscription.token,
		})
	}

	/// `false` when the subscription was already gone or the multiplexer isn't running.
	pub fn on_deactivate(&self, handle: &SubscriptionHandle) -> bool {
		match self.supervisor.registry() {
			Ok(registry) => registry.unregister(handle.id),
			Err(_) => {
				trace!(id = %handle.id, "Deactivating while stopped, nothing to do");
				false
			}
		}
	}

	#[must_use]
	pub fn status(&self) -> SupervisorState {
		self.supervisor.status()
	}

	#[must_use]
	pub fn health(&self) -> Health {
		self.supervisor.health()
	}

	pub fn registry(&self) -> Result<Arc<SubscriptionRegistry>, Error> {
		self.supervisor.registry()
	}

	#[must_use]
	pub const fn config(&self) -> &MuxConfig {
		self.supervisor.config()
	}
}

impl Drop for WatchMultiplexer {
	fn drop(&mut self) {
		if self.supervisor.stop().is_ok() {
			debug!("Watch multiplexer stopped on drop");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::{backend::manual_backend, EventKind};

	#[test]
	fn activation_overrides_channel_config() {
		let (factory, handle) = manual_backend();
		let mux = WatchMultiplexer::with_backend(MuxConfig::default(), factory);

		assert!(matches!(
			mux.on_activate(Activation::new("/tmp/a", EventKinds::all())),
			Err(Error::NotRunning)
		));

		mux.on_start().unwrap();

		let subscriber = mux
			.on_activate(
				Activation::new("/tmp/a", EventKinds::all())
					.handler("overrides")
					.capacity(1)
					.policy(OverflowPolicy::DropNewest),
			)
			.unwrap();
		assert_eq!(subscriber.path(), Path::new("/tmp/a"));

		handle.change(EventKind::Created, "/tmp/a/x");
		handle.change(EventKind::Created, "/tmp/a/y");

		let first = subscriber.take().unwrap();
		assert_eq!(first.path, Path::new("/tmp/a/x"));
		assert_eq!(first.subscription, subscriber.handle().id);

		assert!(mux.on_deactivate(&subscriber.handle()));
		assert!(!mux.on_deactivate(&subscriber.handle()));
		assert!(matches!(subscriber.take(), Err(Error::Closed)));
	}

	#[test]
	fn drop_stops_the_multiplexer() {
		let (factory, handle) = manual_backend();
		let mux = WatchMultiplexer::with_backend(MuxConfig::default(), factory);
		mux.on_start().unwrap();

		let subscriber = mux
			.on_activate(Activation::new("/tmp/a", EventKinds::all()))
			.unwrap();
		drop(mux);

		// the source is closed, nothing reaches the subscriber anymore
		handle.change(EventKind::Created, "/tmp/a/x");
		assert!(matches!(subscriber.take(), Err(Error::Closed)));
		assert!(matches!(subscriber.try_take(), Err(Error::Closed)));
	}
}
