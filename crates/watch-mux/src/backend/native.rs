//! Backend over the platform's recommended `notify` watcher (inotify, FSEvents, ReadDirectoryChangesW, kqueue)

use std::{
	fs, io,
	path::{Path, PathBuf},
};

use notify::{
	event::{ModifyKind, RenameMode},
	Config, ErrorKind, Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::{debug, error, trace, warn};

use super::{BackendEvent, BackendFactory, EventSink, WatchBackend};
use crate::{Error, EventKind};

/// `ENOSPC`, what `inotify_add_watch` answers once `max_user_watches` is reached
#[cfg(target_os = "linux")]
const NO_SPACE_LEFT: i32 = 28;

#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyFactory;

impl BackendFactory for NotifyFactory {
	fn open(&self, sink: EventSink) -> Result<Box<dyn WatchBackend>, Error> {
		let watcher = RecommendedWatcher::new(
			move |result: notify::Result<Event>| match result {
				Ok(event) => {
					trace!(?event, "Received file system event");
					for event in backend_events(event) {
						sink.emit(event);
					}
				}
				Err(e) => handle_watcher_error(&sink, e),
			},
			Config::default(),
		)
		.map_err(|e| Error::SourceUnavailable(e.to_string()))?;

		debug!("Opened native watcher");

		Ok(Box::new(NotifyBackend { watcher }))
	}
}

#[derive(Debug)]
pub struct NotifyBackend {
	watcher: RecommendedWatcher,
}

impl WatchBackend for NotifyBackend {
	fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
		let resolved = fs::canonicalize(path).map_err(|e| {
			if e.kind() == io::ErrorKind::NotFound {
				Error::PathNotFound(path.to_path_buf())
			} else {
				Error::Io(e)
			}
		})?;

		if resolved.is_dir() {
			Ok(resolved)
		} else {
			Err(Error::NotADirectory(resolved))
		}
	}

	fn watch(&mut self, path: &Path) -> Result<(), Error> {
		self.watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|e| map_error(e, path))
	}

	fn unwatch(&mut self, path: &Path) -> Result<(), Error> {
		match self.watcher.unwatch(path) {
			Ok(()) => Ok(()),
			// the directory went away together with its watch
			Err(e) if matches!(e.kind, ErrorKind::WatchNotFound | ErrorKind::PathNotFound) => {
				trace!(?e, path = %path.display(), "Directory was no longer watched");
				Ok(())
			}
			Err(e) => Err(map_error(e, path)),
		}
	}
}

fn map_error(e: notify::Error, path: &Path) -> Error {
	match e.kind {
		ErrorKind::PathNotFound => Error::PathNotFound(path.to_path_buf()),
		ErrorKind::MaxFilesWatch => Error::WatchLimitExceeded {
			path: path.to_path_buf(),
			limit: None,
		},
		ErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound => {
			Error::PathNotFound(path.to_path_buf())
		}
		#[cfg(target_os = "linux")]
		ErrorKind::Io(e) if e.raw_os_error() == Some(NO_SPACE_LEFT) => Error::WatchLimitExceeded {
			path: path.to_path_buf(),
			limit: None,
		},
		ErrorKind::Io(e) => Error::Io(e),
		ErrorKind::Generic(reason) => Error::SourceUnavailable(reason),
		other => Error::SourceUnavailable(format!(
			"unexpected watcher error for {}: {other:?}",
			path.display()
		)),
	}
}

fn handle_watcher_error(sink: &EventSink, e: notify::Error) {
	match e.kind {
		ErrorKind::Io(_) | ErrorKind::Generic(_) => {
			error!(?e, "Native watcher failed;");
			sink.fail(e.to_string());
		}
		ErrorKind::PathNotFound | ErrorKind::WatchNotFound => {
			debug!(?e, "Watched path vanished;");
		}
		_ => warn!(?e, "Native watcher error;"),
	}
}

/// Normalizes a `notify` event into changes on individual paths.
///
/// Renames on inotify arrive as `From`, `To` and then `Both`; the `Both` half repeats the first
/// two so it is skipped. Backends that can't pair rename halves report `Any`, resolved by
/// checking whether the path still exists.
fn backend_events(event: Event) -> Vec<BackendEvent> {
	if event.need_rescan() {
		return vec![BackendEvent::overflow(event.paths.into_iter().next())];
	}

	let kind = match event.kind {
		NotifyKind::Create(_) | NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
			Some(EventKind::Created)
		}
		NotifyKind::Remove(_) | NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
			Some(EventKind::Deleted)
		}
		NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
		NotifyKind::Modify(ModifyKind::Name(_)) => {
			return event
				.paths
				.into_iter()
				.map(|path| {
					let kind = if path.exists() {
						EventKind::Created
					} else {
						EventKind::Deleted
					};
					BackendEvent::change(kind, path)
				})
				.collect();
		}
		NotifyKind::Modify(_) => Some(EventKind::Modified),
		_ => None,
	};

	kind.map_or_else(Vec::new, |kind| {
		event
			.paths
			.into_iter()
			.map(|path| BackendEvent::change(kind, path))
			.collect()
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	use notify::event::{AccessKind, CreateKind, DataChange, Flag, RemoveKind};

	#[test]
	fn maps_notify_kinds() {
		let created = Event::new(NotifyKind::Create(CreateKind::File)).add_path("/a/x".into());
		assert_eq!(
			backend_events(created),
			vec![BackendEvent::change(EventKind::Created, "/a/x")]
		);

		let removed = Event::new(NotifyKind::Remove(RemoveKind::Any)).add_path("/a/x".into());
		assert_eq!(
			backend_events(removed),
			vec![BackendEvent::change(EventKind::Deleted, "/a/x")]
		);

		let written = Event::new(NotifyKind::Modify(ModifyKind::Data(DataChange::Any)))
			.add_path("/a/x".into());
		assert_eq!(
			backend_events(written),
			vec![BackendEvent::change(EventKind::Modified, "/a/x")]
		);

		let closed = Event::new(NotifyKind::Access(AccessKind::Any)).add_path("/a/x".into());
		assert!(backend_events(closed).is_empty());
	}

	#[test]
	fn maps_rename_halves() {
		let from = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::From)))
			.add_path("/a/old".into());
		let to = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::To)))
			.add_path("/a/new".into());
		let both = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
			.add_path("/a/old".into())
			.add_path("/a/new".into());

		assert_eq!(
			backend_events(from),
			vec![BackendEvent::change(EventKind::Deleted, "/a/old")]
		);
		assert_eq!(
			backend_events(to),
			vec![BackendEvent::change(EventKind::Created, "/a/new")]
		);
		assert!(backend_events(both).is_empty());
	}

	#[test]
	fn ambiguous_rename_checks_existence() {
		let dir = tempfile::tempdir().unwrap();
		let present = dir.path().join("present");
		fs::write(&present, b"").unwrap();
		let gone = dir.path().join("gone");

		let event = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Any)))
			.add_path(present.clone())
			.add_path(gone.clone());

		assert_eq!(
			backend_events(event),
			vec![
				BackendEvent::change(EventKind::Created, present),
				BackendEvent::change(EventKind::Deleted, gone),
			]
		);
	}

	#[test]
	fn rescan_becomes_overflow() {
		let event = Event::new(NotifyKind::Other).set_flag(Flag::Rescan);
		assert_eq!(backend_events(event), vec![BackendEvent::overflow(None)]);
	}

	#[test]
	fn resolve_rejects_missing_and_files() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file");
		fs::write(&file, b"").unwrap();

		let backend = NotifyFactory
			.open(test_sink())
			.expect("native watcher should open");

		assert!(matches!(
			backend.resolve(&dir.path().join("missing")),
			Err(Error::PathNotFound(_))
		));
		assert!(matches!(
			backend.resolve(&file),
			Err(Error::NotADirectory(_))
		));
		assert_eq!(
			backend.resolve(dir.path()).unwrap(),
			fs::canonicalize(dir.path()).unwrap()
		);
	}

	fn test_sink() -> EventSink {
		let (tx, _rx) = async_channel::unbounded();
		EventSink::new(Default::default(), tx, 0)
	}
}
