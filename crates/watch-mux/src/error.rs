use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// The watch primitive is missing or its resources are exhausted. Recoverable at runtime.
	#[error("watch source unavailable: {0}")]
	SourceUnavailable(String),
	#[error("watched path not found: <path='{}'>", .0.display())]
	PathNotFound(PathBuf),
	#[error("watched path is not a directory: <path='{}'>", .0.display())]
	NotADirectory(PathBuf),
	/// `limit` is only known when the cap is ours rather than the OS's
	#[error("watch limit exceeded: <path='{}'>", .path.display())]
	WatchLimitExceeded { path: PathBuf, limit: Option<usize> },
	#[error("subscription must be interested in at least one event kind")]
	EmptyKindFilter,

	/// Orderly shutdown, terminal for whatever observed it.
	#[error("closed")]
	Closed,
	#[error("tried to start an already running watch multiplexer")]
	AlreadyRunning,
	#[error("watch multiplexer is not running")]
	NotRunning,

	#[error("invalid configuration: {0}")]
	Config(#[from] serde_json::Error),
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl Error {
	#[must_use]
	pub const fn is_closed(&self) -> bool {
		matches!(self, Self::Closed)
	}
}
