//! Launcher error types.
//!
//! Transport and protocol failures (`ChannelError`, `DecodeError`,
//! `EncodeError`, `WaitError`) end the connection and surface through
//! `LauncherError`. Launch-semantic failures (`BuildError`) never do:
//! they are folded into the Launch response.

use std::fmt;

use crate::status::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer closed its end.
    PeerClosed,
    /// The kernel cut the message or its handle list short.
    Truncated,
    /// More handles attached than a message may carry.
    TooManyHandles(usize),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Truncated => write!(f, "message truncated"),
            Self::TooManyHandles(n) => write!(f, "too many handles: {}", n),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a message header.
    ShortHeader(usize),
    /// Body ended while reading a field at `offset`.
    Truncated { offset: usize },
    /// Bytes left over after the last field.
    TrailingBytes(usize),
    /// Handles left over after the last field.
    TrailingHandles(usize),
    /// A required handle was marked absent.
    MissingHandle,
    /// A handle marker referenced more handles than were attached.
    HandleUnderflow,
    /// Handle marker other than present/absent.
    BadHandleMarker(u32),
    StringTooLong { len: usize, max: usize },
    VectorTooLong { count: usize, max: usize },
    /// String contained a NUL byte.
    InteriorNul,
    /// Response did not match the request it answers.
    Mismatch { field: &'static str, expected: u32, actual: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortHeader(n) => write!(f, "message too short for header: {} bytes", n),
            Self::Truncated { offset } => write!(f, "message truncated at offset {}", offset),
            Self::TrailingBytes(n) => write!(f, "{} unread bytes", n),
            Self::TrailingHandles(n) => write!(f, "{} unread handles", n),
            Self::MissingHandle => write!(f, "required handle absent"),
            Self::HandleUnderflow => write!(f, "handle marker without attached handle"),
            Self::BadHandleMarker(m) => write!(f, "bad handle marker 0x{:x}", m),
            Self::StringTooLong { len, max } => write!(f, "string of {} bytes exceeds {}", len, max),
            Self::VectorTooLong { count, max } => {
                write!(f, "vector of {} entries exceeds {}", count, max)
            }
            Self::InteriorNul => write!(f, "string contains NUL"),
            Self::Mismatch { field, expected, actual } => {
                write!(f, "{} mismatch: expected {}, got {}", field, expected, actual)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    TooLarge(usize),
    TooManyHandles(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(n) => write!(f, "encoded message of {} bytes too large", n),
            Self::TooManyHandles(n) => write!(f, "encoded message carries {} handles", n),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// No room to queue the registration.
    QueueFull,
    /// Submitting registrations to the kernel failed.
    Submit(i32),
    /// The wait itself completed with an error.
    Os(i32),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "wait queue full"),
            Self::Submit(e) => write!(f, "wait submit: errno {}", e),
            Self::Os(e) => write!(f, "wait failed: errno {}", e),
        }
    }
}

impl std::error::Error for WaitError {}

/// A failed builder step: status plus an optional human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub status: Status,
    pub message: Option<String>,
}

impl BuildError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: Some(message.into()) }
    }

    pub fn from_status(status: Status) -> Self {
        Self { status, message: None }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.status, m),
            None => write!(f, "{}", self.status),
        }
    }
}

impl std::error::Error for BuildError {}

/// Connection-fatal condition reported to the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherError {
    PeerClosed,
    Channel(ChannelError),
    /// Payload of operation `op` failed to decode.
    Decode { op: &'static str, err: DecodeError },
    Encode(EncodeError),
    /// Operation code with no handler.
    UnknownOrdinal(u32),
    Wait(WaitError),
    /// Activity on a connection that was already torn down.
    BadState,
    /// The service closed the connection while stopping.
    Shutdown,
}

impl LauncherError {
    pub fn status(&self) -> Status {
        match self {
            Self::PeerClosed | Self::Channel(ChannelError::PeerClosed) => Status::PEER_CLOSED,
            Self::Channel(ChannelError::Truncated) => Status::BUFFER_TOO_SMALL,
            Self::Channel(ChannelError::TooManyHandles(_)) => Status::NO_RESOURCES,
            Self::Channel(ChannelError::Os(_)) => Status::IO,
            Self::Decode { .. } => Status::INVALID_ARGS,
            Self::Encode(_) => Status::INTERNAL,
            Self::UnknownOrdinal(_) => Status::NOT_SUPPORTED,
            Self::Wait(_) => Status::IO,
            Self::BadState | Self::Shutdown => Status::BAD_STATE,
        }
    }
}

impl fmt::Display for LauncherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Channel(e) => write!(f, "channel: {}", e),
            Self::Decode { op, err } => write!(f, "{}: {}", op, err),
            Self::Encode(e) => write!(f, "encode: {}", e),
            Self::UnknownOrdinal(o) => write!(f, "unknown ordinal {}", o),
            Self::Wait(e) => write!(f, "wait: {}", e),
            Self::BadState => write!(f, "connection already closed"),
            Self::Shutdown => write!(f, "service shutting down"),
        }
    }
}

impl std::error::Error for LauncherError {}

impl From<ChannelError> for LauncherError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::PeerClosed => Self::PeerClosed,
            other => Self::Channel(other),
        }
    }
}

impl From<WaitError> for LauncherError {
    fn from(e: WaitError) -> Self {
        Self::Wait(e)
    }
}

impl From<EncodeError> for LauncherError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
