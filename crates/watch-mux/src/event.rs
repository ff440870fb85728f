//! Event and identifier types shared by every stage of the multiplexer

use std::{
	ffi::OsString,
	fmt,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Kinds of changes reported by the watch source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
	/// An entry appeared in the watched directory
	Created,
	/// An entry disappeared from the watched directory
	Deleted,
	/// An entry's contents or metadata changed
	Modified,
	/// The watch primitive lost events, the directory must be rescanned
	Overflow,
}

bitflags! {
	/// Set of event kinds a subscription is interested in.
	///
	/// `Overflow` has no flag: resync notifications reach every subscription.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct EventKinds: u8 {
		const CREATED = 1 << 0;
		const DELETED = 1 << 1;
		const MODIFIED = 1 << 2;
	}
}

impl EventKinds {
	#[must_use]
	pub fn accepts(self, kind: EventKind) -> bool {
		match kind {
			EventKind::Overflow => true,
			kind => self.contains(kind.into()),
		}
	}
}

impl From<EventKind> for EventKinds {
	fn from(kind: EventKind) -> Self {
		match kind {
			EventKind::Created => Self::CREATED,
			EventKind::Deleted => Self::DELETED,
			EventKind::Modified => Self::MODIFIED,
			EventKind::Overflow => Self::empty(),
		}
	}
}

impl FromIterator<EventKind> for EventKinds {
	fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
		iter.into_iter()
			.fold(Self::empty(), |kinds, kind| kinds | kind.into())
	}
}

/// Handle for one directory registered with the watch source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken(pub(crate) u64);

impl fmt::Display for WatchToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "watch#{}", self.0)
	}
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique for the whole process lifetime, across multiplexer restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
	pub(crate) fn next() -> Self {
		Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "sub#{}", self.0)
	}
}

/// Opaque name of the handler that owns a subscription, only used for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HandlerRef(String);

impl HandlerRef {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for HandlerRef {
	fn from(name: &str) -> Self {
		Self(name.to_string())
	}
}

impl From<String> for HandlerRef {
	fn from(name: String) -> Self {
		Self(name)
	}
}

impl fmt::Display for HandlerRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A change record as produced by the watch source, before routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
	pub token: WatchToken,
	pub kind: EventKind,
	/// `None` for overflows and for changes to the watched directory itself
	pub child: Option<OsString>,
	/// Monotonic per token, gaps mean lost events
	pub seq: u64,
}

/// An event placed on a subscriber channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredEvent {
	pub subscription: SubscriptionId,
	pub path: PathBuf,
	pub kind: EventKind,
	pub seq: u64,
}

impl DeliveredEvent {
	pub(crate) fn from_raw(
		subscription: SubscriptionId,
		watched: &Path,
		raw: &RawEvent,
	) -> Self {
		Self {
			subscription,
			path: raw
				.child
				.as_ref()
				.map_or_else(|| watched.to_path_buf(), |child| watched.join(child)),
			kind: raw.kind,
			seq: raw.seq,
		}
	}

	/// Resync notifications tell the consumer to rescan [`DeliveredEvent::path`]
	#[must_use]
	pub fn is_resync(&self) -> bool {
		self.kind == EventKind::Overflow
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kinds_filter() {
		let kinds = [EventKind::Created, EventKind::Modified]
			.into_iter()
			.collect::<EventKinds>();

		assert!(kinds.accepts(EventKind::Created));
		assert!(kinds.accepts(EventKind::Modified));
		assert!(!kinds.accepts(EventKind::Deleted));
		assert!(kinds.accepts(EventKind::Overflow));
		assert!(EventKinds::empty().accepts(EventKind::Overflow));
	}

	#[test]
	fn delivered_path_joins_child() {
		let id = SubscriptionId::next();
		let raw = RawEvent {
			token: WatchToken(1),
			kind: EventKind::Created,
			child: Some("x".into()),
			seq: 3,
		};

		let delivered = DeliveredEvent::from_raw(id, Path::new("/tmp/a"), &raw);
		assert_eq!(delivered.path, Path::new("/tmp/a/x"));
		assert_eq!(delivered.seq, 3);
		assert!(!delivered.is_resync());

		let overflow = RawEvent {
			kind: EventKind::Overflow,
			child: None,
			..raw
		};
		let delivered = DeliveredEvent::from_raw(id, Path::new("/tmp/a"), &overflow);
		assert_eq!(delivered.path, Path::new("/tmp/a"));
		assert!(delivered.is_resync());
	}

	#[test]
	fn subscription_ids_are_unique() {
		let a = SubscriptionId::next();
		let b = SubscriptionId::next();
		assert_ne!(a, b);
		assert!(b > a);
	}
}
