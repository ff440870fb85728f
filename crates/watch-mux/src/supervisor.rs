//! Lifecycle of the watch source and its dispatch thread

use std::{fmt, sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
	backend::BackendFactory,
	config::MuxConfig,
	dispatch::DispatchLoop,
	metrics::{MetricsSnapshot, MuxMetrics},
	registry::SubscriptionRegistry,
	source::WatchSource,
	Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SupervisorState {
	Stopped,
	Starting,
	Running,
	/// The watch source failed and is being reopened, nothing is delivered meanwhile
	Degraded,
	Stopping,
}

impl fmt::Display for SupervisorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = match self {
			Self::Stopped => "stopped",
			Self::Starting => "starting",
			Self::Running => "running",
			Self::Degraded => "degraded",
			Self::Stopping => "stopping",
		};

		f.write_str(state)
	}
}

/// Health probe answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
	pub state: SupervisorState,
	pub last_failure: Option<String>,
	pub metrics: MetricsSnapshot,
}

/// Exponential delays, doubling from `initial` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
	max: Duration,
	next: Duration,
	attempts: u32,
}

impl Backoff {
	#[must_use]
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			max,
			next: initial.min(max),
			attempts: 0,
		}
	}

	pub fn next_delay(&mut self) -> Duration {
		let delay = self.next;
		self.next = (self.next * 2).min(self.max);
		self.attempts += 1;
		delay
	}

	#[must_use]
	pub const fn attempts(&self) -> u32 {
		self.attempts
	}
}

/// State shared between the supervisor and the dispatch thread
#[derive(Debug)]
pub(crate) struct Lifecycle {
	state: Mutex<SupervisorState>,
	last_failure: Mutex<Option<String>>,
	pub(crate) metrics: Arc<MuxMetrics>,
	backoff_initial: Duration,
	backoff_max: Duration,
}

impl Lifecycle {
	pub(crate) fn new(config: &MuxConfig) -> Self {
		Self {
			state: Mutex::new(SupervisorState::Stopped),
			last_failure: Mutex::default(),
			metrics: Arc::default(),
			backoff_initial: config.backoff_initial(),
			backoff_max: config.backoff_max(),
		}
	}

	fn state(&self) -> SupervisorState {
		*self.state.lock()
	}

	fn set(&self, to: SupervisorState) {
		let from = std::mem::replace(&mut *self.state.lock(), to);
		if from != to {
			debug!(%from, %to, "Watch multiplexer state changed");
		}
	}

	/// Moves to `to` only if currently in `from`
	fn transition(&self, from: SupervisorState, to: SupervisorState) -> bool {
		let mut state = self.state.lock();
		if *state != from {
			return false;
		}

		*state = to;
		debug!(%from, %to, "Watch multiplexer state changed");
		true
	}

	fn fail(&self, reason: String) {
		*self.last_failure.lock() = Some(reason);
	}

	/// Reopens the watch source until it works again or the source gets closed.
	pub(crate) async fn recover(&self, source: &WatchSource, reason: String) {
		self.metrics.record_source_failure();

		if !self.transition(SupervisorState::Running, SupervisorState::Degraded) {
			debug!(state = %self.state(), "Watch source failed outside of normal operation");
			if source.is_closed() {
				return;
			}
		}

		warn!(%reason, "Watch source unavailable, entering degraded mode;");
		self.fail(reason);

		let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);

		loop {
			let delay = backoff.next_delay();

			tokio::select! {
				() = source.closed() => {
					debug!("Watch source closed while degraded, giving up on recovery");
					return;
				}
				() = sleep(delay) => {}
			}

			match source.reopen() {
				Ok(()) => {
					self.metrics.record_source_restart();
					self.transition(SupervisorState::Degraded, SupervisorState::Running);
					info!(attempts = backoff.attempts(), "Watch source recovered");
					return;
				}

				Err(Error::Closed) => return,

				Err(e) => {
					warn!(
						?e,
						attempt = backoff.attempts(),
						?delay,
						"Unable to reopen watch source;"
					);
					self.fail(e.to_string());
				}
			}
		}
	}
}

#[derive(Debug)]
struct Active {
	source: Arc<WatchSource>,
	registry: Arc<SubscriptionRegistry>,
	dispatch: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Supervisor {
	config: MuxConfig,
	factory: Arc<dyn BackendFactory>,
	lifecycle: Arc<Lifecycle>,
	active: Mutex<Option<Active>>,
}

impl Supervisor {
	pub fn new(config: MuxConfig, factory: Arc<dyn BackendFactory>) -> Self {
		Self {
			lifecycle: Arc::new(Lifecycle::new(&config)),
			config,
			factory,
			active: Mutex::default(),
		}
	}

	/// Opens the watch source and spawns the dispatch thread.
	pub fn start(&self) -> Result<(), Error> {
		let mut active = self.active.lock();
		if active.is_some() {
			return Err(Error::AlreadyRunning);
		}

		self.lifecycle.set(SupervisorState::Starting);

		let source = match WatchSource::open(
			Arc::clone(&self.factory),
			self.config.max_watches,
			self.config.source_queue_capacity,
		) {
			Ok(source) => Arc::new(source),
			Err(e) => {
				error!(?e, "Failed to open watch source;");
				self.lifecycle.fail(e.to_string());
				self.lifecycle.set(SupervisorState::Stopped);
				return Err(e);
			}
		};

		let registry = Arc::new(SubscriptionRegistry::new(
			Arc::clone(&source),
			Arc::clone(&self.lifecycle.metrics),
		));

		// set before the thread exists so an early failure finds us running
		self.lifecycle.set(SupervisorState::Running);

		let dispatch = DispatchLoop::new(
			Arc::clone(&source),
			Arc::clone(&registry),
			Arc::clone(&self.lifecycle),
		)
		.spawn(&self.config.dispatch_thread_name);

		let dispatch = match dispatch {
			Ok(dispatch) => dispatch,
			Err(e) => {
				error!(?e, "Failed to spawn dispatch thread;");
				source.close();
				self.lifecycle.fail(e.to_string());
				self.lifecycle.set(SupervisorState::Stopped);
				return Err(e);
			}
		};

		*active = Some(Active {
			source,
			registry,
			dispatch,
		});

		info!("Watch multiplexer started");

		Ok(())
	}

	/// Closes the watch source, joins the dispatch thread and then closes every subscriber channel.
	pub fn stop(&self) -> Result<(), Error> {
		let mut active = self.active.lock();
		let Some(Active {
			source,
			registry,
			dispatch,
		}) = active.take()
		else {
			return Err(Error::NotRunning);
		};

		self.lifecycle.set(SupervisorState::Stopping);

		source.close();

		if dispatch.join().is_err() {
			error!("Dispatch thread panicked while shutting down;");
		}

		// nothing can be enqueued anymore, the dispatch thread is gone
		registry.close_all();

		self.lifecycle.set(SupervisorState::Stopped);
		self.lifecycle.metrics.log_metrics();

		info!("Watch multiplexer stopped");

		Ok(())
	}

	pub fn registry(&self) -> Result<Arc<SubscriptionRegistry>, Error> {
		self.active
			.lock()
			.as_ref()
			.map(|active| Arc::clone(&active.registry))
			.ok_or(Error::NotRunning)
	}

	#[must_use]
	pub fn status(&self) -> SupervisorState {
		self.lifecycle.state()
	}

	#[must_use]
	pub fn health(&self) -> Health {
		Health {
			state: self.lifecycle.state(),
			last_failure: self.lifecycle.last_failure.lock().clone(),
			metrics: self.lifecycle.metrics.snapshot(),
		}
	}

	#[must_use]
	pub const fn config(&self) -> &MuxConfig {
		&self.config
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::backend::manual_backend;

	#[test]
	fn backoff_doubles_up_to_the_cap() {
		let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));

		let delays = (0..5).map(|_| backoff.next_delay()).collect::<Vec<_>>();
		assert_eq!(
			delays,
			[100, 200, 350, 350, 350].map(Duration::from_millis).to_vec()
		);
		assert_eq!(backoff.attempts(), 5);
	}

	#[test]
	fn lifecycle_transitions() {
		let (factory, _handle) = manual_backend();
		let supervisor = Supervisor::new(MuxConfig::default(), Arc::new(factory));

		assert_eq!(supervisor.status(), SupervisorState::Stopped);
		assert!(matches!(supervisor.stop(), Err(Error::NotRunning)));
		assert!(matches!(supervisor.registry(), Err(Error::NotRunning)));

		supervisor.start().unwrap();
		assert_eq!(supervisor.status(), SupervisorState::Running);
		assert!(matches!(supervisor.start(), Err(Error::AlreadyRunning)));

		supervisor.stop().unwrap();
		assert_eq!(supervisor.status(), SupervisorState::Stopped);
		assert!(matches!(supervisor.stop(), Err(Error::NotRunning)));

		// and again, with a fresh source
		supervisor.start().unwrap();
		supervisor.stop().unwrap();
	}

	#[test]
	fn failed_start_is_reported() {
		let (factory, handle) = manual_backend();
		handle.fail_next_opens(1);
		let supervisor = Supervisor::new(MuxConfig::default(), Arc::new(factory));

		assert!(matches!(
			supervisor.start(),
			Err(Error::SourceUnavailable(_))
		));

		let health = supervisor.health();
		assert_eq!(health.state, SupervisorState::Stopped);
		assert!(health.last_failure.is_some());
	}
}
