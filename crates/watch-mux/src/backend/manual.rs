//! In-process backend driven by hand
//!
//! Nothing is observed from the file system: events and failures are injected through a
//! [`ManualHandle`]. Useful for embedding the multiplexer behind another event producer and for
//! exercising dispatch deterministically.

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	path::{Path, PathBuf},
	sync::Arc,
};

use parking_lot::Mutex;
use tracing::trace;

use super::{BackendEvent, BackendFactory, EventSink, WatchBackend};
use crate::{Error, EventKind};

#[derive(Debug, Default)]
struct ManualState {
	sink: Option<EventSink>,
	watched: BTreeSet<PathBuf>,
	missing: HashSet<PathBuf>,
	unwatches: HashMap<PathBuf, usize>,
	os_limit: Option<usize>,
	failing_opens: usize,
	opens: usize,
}

#[must_use]
pub fn manual_backend() -> (ManualFactory, ManualHandle) {
	let state = Arc::new(Mutex::new(ManualState::default()));

	(
		ManualFactory {
			state: Arc::clone(&state),
		},
		ManualHandle { state },
	)
}

#[derive(Debug, Clone)]
pub struct ManualFactory {
	state: Arc<Mutex<ManualState>>,
}

impl BackendFactory for ManualFactory {
	fn open(&self, sink: EventSink) -> Result<Box<dyn WatchBackend>, Error> {
		let mut state = self.state.lock();

		if state.failing_opens > 0 {
			state.failing_opens -= 1;
			return Err(Error::SourceUnavailable(
				"manual backend refused to open".to_string(),
			));
		}

		state.opens += 1;
		state.watched.clear();
		state.sink = Some(sink);

		Ok(Box::new(ManualBackend {
			state: Arc::clone(&self.state),
		}))
	}
}

#[derive(Debug)]
pub struct ManualBackend {
	state: Arc<Mutex<ManualState>>,
}

impl WatchBackend for ManualBackend {
	fn watch(&mut self, path: &Path) -> Result<(), Error> {
		let mut state = self.state.lock();

		if state.missing.contains(path) {
			return Err(Error::PathNotFound(path.to_path_buf()));
		}

		if state
			.os_limit
			.is_some_and(|limit| state.watched.len() >= limit)
		{
			return Err(Error::WatchLimitExceeded {
				path: path.to_path_buf(),
				limit: None,
			});
		}

		state.watched.insert(path.to_path_buf());
		Ok(())
	}

	fn unwatch(&mut self, path: &Path) -> Result<(), Error> {
		let mut state = self.state.lock();
		if state.watched.remove(path) {
			*state.unwatches.entry(path.to_path_buf()).or_default() += 1;
		}
		Ok(())
	}
}

/// Drives the backends opened by the paired [`ManualFactory`]
#[derive(Debug, Clone)]
pub struct ManualHandle {
	state: Arc<Mutex<ManualState>>,
}

impl ManualHandle {
	/// Returns `false` when no backend is open to receive the event.
	///
	/// Deleting a watched directory drops its watch, as the OS would.
	pub fn emit(&self, event: BackendEvent) -> bool {
		// released before emitting, the sink takes the source's watch table lock
		let sink = {
			let mut state = self.state.lock();
			if let BackendEvent::Change {
				kind: EventKind::Deleted,
				path,
			} = &event
			{
				state.watched.remove(path);
			}
			state.sink.clone()
		};

		let Some(sink) = sink else {
			trace!(?event, "No manual backend open, dropping event");
			return false;
		};

		sink.emit(event);
		true
	}

	pub fn change(&self, kind: EventKind, path: impl Into<PathBuf>) -> bool {
		self.emit(BackendEvent::change(kind, path))
	}

	pub fn overflow(&self, path: Option<PathBuf>) -> bool {
		self.emit(BackendEvent::overflow(path))
	}

	/// Simulates the OS facility going away under the current backend
	pub fn fail(&self, reason: impl Into<String>) {
		let sink = self.state.lock().sink.take();
		if let Some(sink) = sink {
			sink.fail(reason);
		}
	}

	/// The next `count` attempts to open a backend fail with [`Error::SourceUnavailable`]
	pub fn fail_next_opens(&self, count: usize) {
		self.state.lock().failing_opens = count;
	}

	/// Watching `path` fails with [`Error::PathNotFound`] until [`ManualHandle::restore_path`]
	pub fn remove_path(&self, path: impl Into<PathBuf>) {
		self.state.lock().missing.insert(path.into());
	}

	pub fn restore_path(&self, path: impl AsRef<Path>) {
		self.state.lock().missing.remove(path.as_ref());
	}

	/// Simulates the per-process OS watch cap
	pub fn set_os_limit(&self, limit: Option<usize>) {
		self.state.lock().os_limit = limit;
	}

	#[must_use]
	pub fn watched(&self) -> Vec<PathBuf> {
		self.state.lock().watched.iter().cloned().collect()
	}

	#[must_use]
	pub fn unwatch_count(&self, path: impl AsRef<Path>) -> usize {
		self.state
			.lock()
			.unwatches
			.get(path.as_ref())
			.copied()
			.unwrap_or_default()
	}

	#[must_use]
	pub fn opens(&self) -> usize {
		self.state.lock().opens
	}
}
