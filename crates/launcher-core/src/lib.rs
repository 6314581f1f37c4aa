//! # launcher-core: Trait definitions for the process launcher
//!
//! This crate defines the trait boundaries the launcher is built from.
//! Each trait models one collaborator of the per-connection dispatcher:
//!
//! | Trait            | Role                                            |
//! |------------------|-------------------------------------------------|
//! | `Channel`        | message transport carrying bytes and handles    |
//! | `Codec`          | wire encode/decode of requests and responses    |
//! | `Reactor`        | readiness notification for one waiter per key   |
//! | `BuilderFactory` | creates an execution-context builder per launch |
//! | `ContextBuilder` | configures and commits one execution context    |
//!
//! Default implementations live in `launcher-module`; the dispatcher and
//! service loop live in `launcher-executor`. Nothing in here depends on a
//! concrete implementation.

pub mod kprint;
pub mod env;
pub mod status;
pub mod handle;
pub mod error;
pub mod message;
pub mod channel;
pub mod codec;
pub mod reactor;
pub mod builder;
