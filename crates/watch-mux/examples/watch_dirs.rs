//! Prints changes in the directories given on the command line until all of them are removed.
//!
//! `RUST_LOG=sd_watch_mux=debug cargo run -p sd-watch-mux --example watch_dirs -- /tmp/a /tmp/b`

use std::{env, thread};

use sd_watch_mux::{Activation, Error, EventKind, EventKinds, MuxConfig, WatchMultiplexer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Error> {
	tracing_subscriber::fmt()
		.with_file(true)
		.with_line_number(true)
		.with_env_filter(EnvFilter::from_default_env())
		.init();

	let config = match env::var("WATCH_MUX_CONFIG") {
		Ok(path) => MuxConfig::load_from(path)?,
		Err(_) => MuxConfig::default(),
	};

	let mux = WatchMultiplexer::new(config);
	mux.on_start()?;

	let mut consumers = Vec::new();
	for dir in env::args().skip(1) {
		let subscriber =
			mux.on_activate(Activation::new(&dir, EventKinds::all()).handler(dir.as_str()))?;
		info!(path = %subscriber.path().display(), "Watching directory");

		consumers.push(thread::spawn(move || loop {
			match subscriber.take() {
				Ok(event) if event.is_resync() => {
					info!(path = %event.path.display(), "Events were lost, rescan needed");
				}
				Ok(event) if event.kind == EventKind::Deleted && event.path == subscriber.path() => {
					info!(path = %event.path.display(), "Watched directory removed");
					break;
				}
				Ok(event) => info!(kind = ?event.kind, seq = event.seq, path = %event.path.display()),
				Err(e) => {
					if !e.is_closed() {
						error!(?e, "Subscriber failed;");
					}
					break;
				}
			}
		}));
	}

	for consumer in consumers {
		if consumer.join().is_err() {
			error!("Consumer thread panicked;");
		}
	}

	info!(health = ?mux.health(), "Done");

	mux.on_stop()
}
