//! # launcher-executor: Dispatcher and service loop
//!
//! ```text
//!  client ──seqpacket──► Service ──key──► Launcher ──► AccumulationState
//!                          │                 │
//!                          │                 └─ Launch ─► Launchpad ─► ContextBuilder
//!                          └─ signals: reap children, stop
//! ```
//!
//! `Launcher` is generic over every collaborator trait and holds no
//! knowledge of sockets, io_uring or fork. `Service` is the one place
//! that picks the default implementations from `launcher-module`.

pub mod accumulator;
pub mod config;
pub mod launcher;
pub mod launchpad;
pub mod service;

pub use config::LauncherConfig;
pub use launcher::{LaunchStats, Launcher};
pub use service::{Service, ServiceError, Stats};
