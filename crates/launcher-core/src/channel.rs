//! Message transport abstraction.
//!
//! A `Channel` moves whole messages, each a byte payload plus an ordered
//! list of handles, between two endpoints. Message boundaries are kept.
//!
//! # Implementors
//!
//! - `SeqpacketChannel` (default): `AF_UNIX`/`SOCK_SEQPACKET` socket,
//!   handles passed as `SCM_RIGHTS`.

use std::os::fd::RawFd;

use crate::error::ChannelError;
use crate::message::RawMessage;

/// One endpoint of a bidirectional message channel.
///
/// **Contract:**
/// - `read()` must NEVER block. `Ok(None)` means no message is queued
///   right now; the caller waits for readiness and tries again.
/// - After the peer closes, queued messages are still returned in order;
///   only then does `read()` report `ChannelError::PeerClosed`.
/// - `write()` transfers ownership of the message's handles to the peer.
pub trait Channel {
    fn read(&mut self) -> Result<Option<RawMessage>, ChannelError>;

    fn write(&mut self, msg: RawMessage) -> Result<(), ChannelError>;

    /// Descriptor a `Reactor` waits on.
    fn raw_fd(&self) -> RawFd;
}
