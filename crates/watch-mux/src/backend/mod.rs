//! Pluggable implementations of the OS watch primitive
//!
//! A [`BackendFactory`] opens a [`WatchBackend`] bound to an [`EventSink`]. The backend watches
//! single directories (never recursively) and reports what it sees through the sink, from
//! whatever thread it likes. The sink translates those reports into [`RawEvent`]s against the
//! source's watch table, so backends never need to know about tokens or sequence numbers.
//!
//! [`RawEvent`]: crate::RawEvent

use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{source::WatchTable, Error, EventKind, RawEvent};

pub mod manual;
pub mod native;

pub use manual::{manual_backend, ManualBackend, ManualFactory, ManualHandle};
pub use native::{NotifyBackend, NotifyFactory};

pub trait WatchBackend: Send + fmt::Debug {
	/// Returns the path under which this backend will report events for `path`.
	fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
		Ok(path.to_path_buf())
	}

	fn watch(&mut self, path: &Path) -> Result<(), Error>;

	/// Unwatching something that is no longer watched must succeed.
	fn unwatch(&mut self, path: &Path) -> Result<(), Error>;
}

pub trait BackendFactory: Send + Sync + fmt::Debug {
	/// Fails with [`Error::SourceUnavailable`] when the platform facility can't be acquired.
	fn open(&self, sink: EventSink) -> Result<Box<dyn WatchBackend>, Error>;
}

/// What a backend observed, in terms of absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
	Change { kind: EventKind, path: PathBuf },
	/// Events were lost, `None` when the backend can't tell for which directory
	Overflow { path: Option<PathBuf> },
}

impl BackendEvent {
	pub fn change(kind: EventKind, path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		if kind == EventKind::Overflow {
			Self::Overflow { path: Some(path) }
		} else {
			Self::Change { kind, path }
		}
	}

	#[must_use]
	pub const fn overflow(path: Option<PathBuf>) -> Self {
		Self::Overflow { path }
	}
}

#[derive(Debug)]
pub(crate) enum SourceItem {
	/// Everything one backend event translated into
	Events(Vec<RawEvent>),
	Failure { generation: u64, reason: String },
}

/// Where a backend delivers its observations
///
/// Each sink belongs to one backend generation: once the source replaces its backend,
/// whatever the old one still reports is ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
	table: Arc<Mutex<WatchTable>>,
	tx: chan::Sender<SourceItem>,
	generation: u64,
}

impl EventSink {
	pub(crate) const fn new(
		table: Arc<Mutex<WatchTable>>,
		tx: chan::Sender<SourceItem>,
		generation: u64,
	) -> Self {
		Self {
			table,
			tx,
			generation,
		}
	}

	pub fn emit(&self, event: BackendEvent) {
		let mut table = self.table.lock();
		if table.generation() != self.generation {
			trace!(generation = self.generation, "Ignoring event from a replaced backend");
			return;
		}

		let events = table.translate(event);
		if events.is_empty() {
			return;
		}

		// one slot is kept for an overflow and one for a failure report
		if table.lost || !self.has_room(2) {
			self.overrun(&mut table);
			return;
		}

		// pushing while holding the table keeps the queue in sequence order
		if let Err(e) = self.tx.try_send(SourceItem::Events(events)) {
			if e.is_closed() {
				trace!("Watch source closed, dropping backend event");
			} else {
				self.overrun(&mut table);
			}
		}
	}

	/// Replaces what couldn't be queued with an overflow for every token, or remembers to.
	fn overrun(&self, table: &mut WatchTable) {
		if !table.lost {
			warn!(
				queued = self.tx.len(),
				"Watch source queue full, dropping events until a resync gets through;"
			);
		}

		if self.has_room(1) && self.tx.try_send(SourceItem::Events(table.overflow_all())).is_ok() {
			table.lost = false;
		} else {
			table.lost = true;
		}
	}

	/// Whether `reserved` slots stay free after one more push
	fn has_room(&self, reserved: usize) -> bool {
		self.tx
			.capacity()
			.map_or(true, |capacity| self.tx.len() + reserved < capacity)
	}

	/// The backend can't go on, the source will report itself unavailable
	///
	/// Only the first failure of a backend is reported.
	pub fn fail(&self, reason: impl Into<String>) {
		let mut table = self.table.lock();
		if table.generation() != self.generation || table.failed {
			trace!(generation = self.generation, "Backend failure already reported");
			return;
		}

		table.failed = true;

		if self
			.tx
			.try_send(SourceItem::Failure {
				generation: self.generation,
				reason: reason.into(),
			})
			.is_err()
		{
			trace!("Watch source closed, dropping backend failure");
		}
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}
