//! Signed status codes carried in launch responses.
//!
//! Values follow the kernel-object convention the protocol was designed
//! around: zero is success, failures are small negative numbers. The
//! numeric values are part of the wire format and must not change.

use std::fmt;
use std::io;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const INTERNAL: Status = Status(-1);
    pub const NOT_SUPPORTED: Status = Status(-2);
    pub const NO_RESOURCES: Status = Status(-3);
    pub const NO_MEMORY: Status = Status(-4);
    pub const INVALID_ARGS: Status = Status(-10);
    pub const BAD_HANDLE: Status = Status(-11);
    pub const WRONG_TYPE: Status = Status(-12);
    pub const BAD_STATE: Status = Status(-20);
    pub const NOT_FOUND: Status = Status(-25);
    pub const SHOULD_WAIT: Status = Status(-22);
    pub const PEER_CLOSED: Status = Status(-24);
    pub const ACCESS_DENIED: Status = Status(-30);
    pub const IO: Status = Status(-40);
    pub const IO_DATA_INTEGRITY: Status = Status(-42);
    pub const BUFFER_TOO_SMALL: Status = Status(-15);

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    #[inline]
    pub fn into_raw(self) -> i32 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::OK => "OK",
            Status::INTERNAL => "INTERNAL",
            Status::NOT_SUPPORTED => "NOT_SUPPORTED",
            Status::NO_RESOURCES => "NO_RESOURCES",
            Status::NO_MEMORY => "NO_MEMORY",
            Status::INVALID_ARGS => "INVALID_ARGS",
            Status::BAD_HANDLE => "BAD_HANDLE",
            Status::WRONG_TYPE => "WRONG_TYPE",
            Status::BAD_STATE => "BAD_STATE",
            Status::NOT_FOUND => "NOT_FOUND",
            Status::SHOULD_WAIT => "SHOULD_WAIT",
            Status::PEER_CLOSED => "PEER_CLOSED",
            Status::ACCESS_DENIED => "ACCESS_DENIED",
            Status::IO => "IO",
            Status::IO_DATA_INTEGRITY => "IO_DATA_INTEGRITY",
            Status::BUFFER_TOO_SMALL => "BUFFER_TOO_SMALL",
            _ => "UNKNOWN",
        }
    }

    /// Coarse mapping through `io::ErrorKind`. The module crate refines
    /// this per errno where the kind is too generic.
    pub fn from_io_error(err: &io::Error) -> Status {
        match err.kind() {
            io::ErrorKind::NotFound => Status::NOT_FOUND,
            io::ErrorKind::PermissionDenied => Status::ACCESS_DENIED,
            io::ErrorKind::WouldBlock => Status::SHOULD_WAIT,
            io::ErrorKind::InvalidInput => Status::INVALID_ARGS,
            io::ErrorKind::InvalidData => Status::IO_DATA_INTEGRITY,
            io::ErrorKind::OutOfMemory => Status::NO_MEMORY,
            io::ErrorKind::Unsupported => Status::NOT_SUPPORTED,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Status::PEER_CLOSED,
            _ => Status::IO,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status::{}({})", self.name(), self.0)
    }
}
