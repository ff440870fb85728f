//! The single watch source shared by every subscription
//!
//! Owns the backend, the table of watched directories and the queue of raw events. Tokens are
//! handed out per resolved directory and survive backend restarts: [`WatchSource::reopen`]
//! re-watches every known directory under its existing token.
//!
//! The raw event queue is bounded. When the dispatch loop falls behind, the sinks stop queueing
//! changes and queue a single overflow for every token instead, the way the OS reports a full
//! event buffer.

use std::{
	collections::{HashMap, VecDeque},
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
	backend::{BackendEvent, BackendFactory, EventSink, SourceItem, WatchBackend},
	Error, EventKind, RawEvent, WatchToken,
};

#[derive(Debug)]
struct WatchEntry {
	path: PathBuf,
	next_seq: u64,
	/// Whether the backend currently holds an OS watch for this directory
	live: bool,
}

/// Watched directories, shared between the source and its backend's sinks
#[derive(Debug, Default)]
pub(crate) struct WatchTable {
	generation: u64,
	next_token: u64,
	by_token: HashMap<WatchToken, WatchEntry>,
	by_path: HashMap<PathBuf, WatchToken>,
	/// Events were dropped on a full queue and no overflow made it in after them yet
	pub(crate) lost: bool,
	/// The current backend already reported its failure
	pub(crate) failed: bool,
}

impl WatchTable {
	pub(crate) const fn generation(&self) -> u64 {
		self.generation
	}

	fn insert(&mut self, path: PathBuf) -> WatchToken {
		let token = WatchToken(self.next_token);
		self.next_token += 1;

		self.by_path.insert(path.clone(), token);
		self.by_token.insert(
			token,
			WatchEntry {
				path,
				next_seq: 0,
				live: true,
			},
		);

		token
	}

	fn remove(&mut self, token: WatchToken) -> Option<WatchEntry> {
		let entry = self.by_token.remove(&token)?;
		self.by_path.remove(&entry.path);
		Some(entry)
	}

	fn raw(&mut self, token: WatchToken, kind: EventKind, child: Option<&Path>) -> Option<RawEvent> {
		let entry = self.by_token.get_mut(&token)?;
		let seq = entry.next_seq;
		entry.next_seq += 1;

		Some(RawEvent {
			token,
			kind,
			child: child.map(|child| child.as_os_str().to_os_string()),
			seq,
		})
	}

	/// Token of the watched directory `path` is or is directly inside of
	fn owner(&self, path: &Path) -> Option<WatchToken> {
		self.by_path
			.get(path)
			.or_else(|| path.parent().and_then(|parent| self.by_path.get(parent)))
			.copied()
	}

	pub(crate) fn overflow_all(&mut self) -> Vec<RawEvent> {
		let mut tokens = self.by_token.keys().copied().collect::<Vec<_>>();
		tokens.sort_unstable();

		tokens
			.into_iter()
			.filter_map(|token| self.raw(token, EventKind::Overflow, None))
			.collect()
	}

	pub(crate) fn translate(&mut self, event: BackendEvent) -> Vec<RawEvent> {
		match event {
			BackendEvent::Overflow { path: None } => self.overflow_all(),

			BackendEvent::Overflow { path: Some(path) } => self
				.owner(&path)
				.and_then(|token| self.raw(token, EventKind::Overflow, None))
				.into_iter()
				.collect(),

			BackendEvent::Change { kind, path } => {
				let mut events = Vec::with_capacity(1);

				// a change to the watched directory itself
				if let Some(&token) = self.by_path.get(&path) {
					if kind == EventKind::Deleted {
						if let Some(entry) = self.by_token.get_mut(&token) {
							debug!(%token, path = %path.display(), "Watched directory removed");
							entry.live = false;
						}
					}
					events.extend(self.raw(token, kind, None));
				}

				// a change to an entry of a watched directory
				if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
					if let Some(&token) = self.by_path.get(parent) {
						events.extend(self.raw(token, kind, Some(Path::new(name))));
					}
				}

				if events.is_empty() {
					trace!(path = %path.display(), "Ignoring event outside watched directories");
				}

				events
			}
		}
	}
}

/// Room for a batch, an overflow and a failure report
const MIN_QUEUE_CAPACITY: usize = 4;

#[derive(Debug)]
pub struct WatchSource {
	factory: Arc<dyn BackendFactory>,
	backend: Mutex<Option<Box<dyn WatchBackend>>>,
	table: Arc<Mutex<WatchTable>>,
	events_tx: chan::Sender<SourceItem>,
	events_rx: chan::Receiver<SourceItem>,
	/// Events of a dequeued batch not handed out yet
	backlog: Mutex<VecDeque<RawEvent>>,
	shutdown: CancellationToken,
	max_watches: usize,
}

impl WatchSource {
	/// `queue_capacity` bounds the raw event batches waiting for the dispatch loop.
	pub fn open(
		factory: Arc<dyn BackendFactory>,
		max_watches: usize,
		queue_capacity: usize,
	) -> Result<Self, Error> {
		let queue_capacity = queue_capacity.max(MIN_QUEUE_CAPACITY);
		let (events_tx, events_rx) = chan::bounded(queue_capacity);

		let source = Self {
			factory,
			backend: Mutex::new(None),
			table: Arc::default(),
			events_tx,
			events_rx,
			backlog: Mutex::default(),
			shutdown: CancellationToken::new(),
			max_watches,
		};

		let backend = source.open_backend()?;
		*source.backend.lock() = Some(backend);

		debug!(max_watches, queue_capacity, "Watch source opened");

		Ok(source)
	}

	fn open_backend(&self) -> Result<Box<dyn WatchBackend>, Error> {
		let generation = {
			let mut table = self.table.lock();
			table.generation += 1;
			table.failed = false;
			table.generation
		};

		let sink = EventSink::new(Arc::clone(&self.table), self.events_tx.clone(), generation);

		self.factory.open(sink).map_err(|e| match e {
			Error::SourceUnavailable(_) => e,
			other => Error::SourceUnavailable(other.to_string()),
		})
	}

	/// Starts watching `path`, or returns the token it is already watched under.
	#[instrument(skip_all, fields(path = %path.display()))]
	pub fn register(&self, path: &Path) -> Result<WatchToken, Error> {
		let mut backend = self.backend.lock();
		if self.is_closed() {
			return Err(Error::Closed);
		}

		let backend = backend.as_mut().ok_or_else(|| {
			Error::SourceUnavailable("watch source is waiting for its backend to recover".to_string())
		})?;

		let resolved = backend.resolve(path)?;

		let known = {
			let table = self.table.lock();
			match table.by_path.get(&resolved) {
				Some(token) => table.by_token.get(token).map(|entry| (*token, entry.live)),
				None if table.by_token.len() >= self.max_watches => {
					return Err(Error::WatchLimitExceeded {
						path: resolved,
						limit: Some(self.max_watches),
					});
				}
				None => None,
			}
		};

		// never call into the backend holding the table, its event thread may be waiting on it
		match known {
			Some((token, true)) => {
				trace!(%token, "Directory already watched");
				return Ok(token);
			}

			// removed and created again, its subscriptions keep their token
			Some((token, false)) => {
				backend.watch(&resolved)?;

				if let Some(entry) = self.table.lock().by_token.get_mut(&token) {
					entry.live = true;
				}
				debug!(%token, "Watching recreated directory again");

				return Ok(token);
			}

			None => backend.watch(&resolved)?,
		}

		let token = self.table.lock().insert(resolved);
		trace!(%token, "Now watching directory");

		Ok(token)
	}

	/// Idempotent, unknown or already released tokens are ignored.
	pub fn unregister(&self, token: WatchToken) {
		let mut backend = self.backend.lock();

		let Some(entry) = self.table.lock().remove(token) else {
			trace!(%token, "Token already released");
			return;
		};

		if !entry.live {
			trace!(%token, "Directory was already gone, nothing to unwatch");
			return;
		}

		if let Some(backend) = backend.as_mut() {
			if let Err(e) = backend.unwatch(&entry.path) {
				warn!(?e, %token, path = %entry.path.display(), "Unable to unwatch directory;");
			} else {
				trace!(%token, path = %entry.path.display(), "Stopped watching directory");
			}
		}
	}

	/// Waits for the next raw event. Fails with [`Error::Closed`] once the source is closed and
	/// with [`Error::SourceUnavailable`] when the backend failed.
	pub async fn next(&self) -> Result<RawEvent, Error> {
		loop {
			if self.is_closed() {
				return Err(Error::Closed);
			}

			if let Some(event) = self.pop_backlog() {
				return Ok(event);
			}

			let item = self.events_rx.recv().await.map_err(|_| Error::Closed)?;
			if let Some(result) = self.accept(item) {
				return result;
			}
		}
	}

	/// Blocking flavour of [`WatchSource::next`], must not be called from an async task.
	pub fn next_blocking(&self) -> Result<RawEvent, Error> {
		loop {
			if self.is_closed() {
				return Err(Error::Closed);
			}

			if let Some(event) = self.pop_backlog() {
				return Ok(event);
			}

			let item = self.events_rx.recv_blocking().map_err(|_| Error::Closed)?;
			if let Some(result) = self.accept(item) {
				return result;
			}
		}
	}

	fn accept(&self, item: SourceItem) -> Option<Result<RawEvent, Error>> {
		if self.is_closed() {
			return Some(Err(Error::Closed));
		}

		match item {
			SourceItem::Events(events) => {
				let mut backlog = self.backlog.lock();
				backlog.extend(events);
				backlog.pop_front().map(Ok)
			}

			SourceItem::Failure { generation, reason } => {
				if generation != self.table.lock().generation {
					trace!(generation, "Ignoring failure of a replaced backend");
					return None;
				}

				// the broken backend is released right away so registrations fail fast
				drop(self.backend.lock().take());

				Some(Err(Error::SourceUnavailable(reason)))
			}
		}
	}

	fn pop_backlog(&self) -> Option<RawEvent> {
		let mut backlog = self.backlog.lock();
		if backlog.is_empty() {
			let mut table = self.table.lock();
			// an overrun whose overflow never fit in the queue, nothing queued is older than it
			if table.lost && self.events_rx.is_empty() {
				table.lost = false;
				backlog.extend(table.overflow_all());
			}
		}

		backlog.pop_front()
	}

	/// Replaces the backend and re-watches every known directory under its existing token.
	///
	/// Every token then gets an overflow, whatever happened while the backend was down is lost.
	pub(crate) fn reopen(&self) -> Result<(), Error> {
		let mut backend = self.backend.lock();
		if self.is_closed() {
			return Err(Error::Closed);
		}

		drop(backend.take());

		let mut fresh = self.open_backend()?;

		let watches = {
			let table = self.table.lock();
			let mut watches = table
				.by_token
				.iter()
				.map(|(token, entry)| (*token, entry.path.clone()))
				.collect::<Vec<_>>();
			watches.sort_unstable_by_key(|(token, _)| *token);
			watches
		};

		let mut rewatched = Vec::with_capacity(watches.len());
		for (token, path) in watches {
			match fresh.watch(&path) {
				Ok(()) => rewatched.push((token, true)),
				Err(e) => {
					warn!(?e, %token, path = %path.display(), "Unable to watch directory again;");
					rewatched.push((token, false));
				}
			}
		}

		*backend = Some(fresh);

		let mut table = self.table.lock();
		for (token, live) in rewatched {
			if let Some(entry) = table.by_token.get_mut(&token) {
				entry.live = live;
			}
		}

		let overflows = table.overflow_all();
		if !overflows.is_empty() && self.events_tx.try_send(SourceItem::Events(overflows)).is_err() {
			table.lost = true;
		}

		debug!(watches = table.by_token.len(), "Watch source reopened");

		Ok(())
	}

	/// Releases the backend and wakes up whoever waits on [`WatchSource::next`]. Terminal.
	pub fn close(&self) {
		if self.shutdown.is_cancelled() {
			return;
		}

		self.shutdown.cancel();
		self.events_tx.close();
		drop(self.backend.lock().take());

		debug!("Watch source closed");
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.shutdown.is_cancelled()
	}

	/// Resolves once [`WatchSource::close`] was called
	pub async fn closed(&self) {
		self.shutdown.cancelled().await;
	}

	#[must_use]
	pub fn path_of(&self, token: WatchToken) -> Option<PathBuf> {
		self.table
			.lock()
			.by_token
			.get(&token)
			.map(|entry| entry.path.clone())
	}

	/// Tokens currently handed out, in allocation order
	#[must_use]
	pub fn tokens(&self) -> Vec<WatchToken> {
		let mut tokens = self.table.lock().by_token.keys().copied().collect::<Vec<_>>();
		tokens.sort_unstable();
		tokens
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.table.lock().by_token.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
