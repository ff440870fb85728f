//!
//! # Watch Multiplexer
//!
//! One native filesystem watch source shared by many subscriptions. Each subscription names a
//! directory and the kinds of changes it cares about, and gets its own bounded channel to consume
//! them from. The multiplexer takes care of:
//! - Watching each resolved directory once, however many subscriptions point at it;
//! - Routing every change, in order, to the subscriptions whose filter accepts it;
//! - Keeping a slow consumer from stalling everybody else, through a per channel overflow policy;
//! - Telling consumers to rescan (a resync event) whenever events were lost;
//! - Reopening the watch source with exponential backoff when the OS takes it away;
//!
//! ## Basic example
//!
//! ```
//! use sd_watch_mux::{
//!     manual_backend, Activation, EventKind, EventKinds, MuxConfig, WatchMultiplexer,
//! };
//!
//! let (factory, handle) = manual_backend();
//! let mux = WatchMultiplexer::with_backend(MuxConfig::default(), factory);
//! mux.on_start().unwrap();
//!
//! let subscriber = mux
//!     .on_activate(Activation::new("/srv/inbox", EventKinds::CREATED).handler("inbox"))
//!     .unwrap();
//!
//! handle.change(EventKind::Created, "/srv/inbox/report.csv");
//!
//! let event = subscriber.take().unwrap();
//! assert_eq!(event.kind, EventKind::Created);
//! assert_eq!(event.path.file_name().unwrap(), "report.csv");
//!
//! mux.on_stop().unwrap();
//! assert!(subscriber.take().is_err());
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod backend;
pub mod channel;
pub mod config;
mod dispatch;
mod error;
mod event;
pub mod metrics;
mod mux;
pub mod registry;
pub mod source;
pub mod supervisor;

pub use backend::{
	manual_backend, BackendEvent, BackendFactory, EventSink, ManualFactory, ManualHandle,
	NotifyFactory, WatchBackend,
};
pub use channel::{channel, ChannelConfig, EventReceiver, EventSender, Offer, OverflowPolicy};
pub use config::MuxConfig;
pub use error::Error;
pub use event::{
	DeliveredEvent, EventKind, EventKinds, HandlerRef, RawEvent, SubscriptionId, WatchToken,
};
pub use metrics::{MetricsSnapshot, MuxMetrics};
pub use mux::{Activation, Subscriber, SubscriptionHandle, WatchMultiplexer};
pub use registry::{Subscription, SubscriptionRegistry};
pub use source::WatchSource;
pub use supervisor::{Health, SupervisorState};
