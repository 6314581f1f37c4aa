//! Handles and startup-handle ids.
//!
//! A handle is an owned file descriptor. Dropping it closes the
//! descriptor, so ownership transfer between accumulation state, the
//! builder and the response is expressed by moves alone.
//!
//! Startup ids pack a type in the low byte and a per-type argument in the
//! upper half: `id = (type & 0xFF) | ((arg & 0xFFFF) << 16)`. A started
//! process finds each of its handles by id in the startup table.

use std::os::fd::OwnedFd;

pub type Handle = OwnedFd;

/// Startup handle types (low byte of an id).
pub mod ty {
    /// The process's own handle.
    pub const PROC_SELF: u32 = 0x01;
    /// Default job for children of the new process.
    pub const JOB_DEFAULT: u32 = 0x03;
    /// Root memory region.
    pub const VMAR_ROOT: u32 = 0x04;
    /// Loader service (dynamic interpreter resolver).
    pub const LDSVC_LOADER: u32 = 0x10;
    /// Namespace directory; the argument is the name-table slot.
    pub const NS_DIR: u32 = 0x20;
    /// File descriptor; the argument is the fd number in the new process.
    pub const FD: u32 = 0x30;
    /// First application-defined type.
    pub const USER0: u32 = 0xF0;
}

#[inline]
pub const fn handle_id(ty: u32, arg: u32) -> u32 {
    (ty & 0xFF) | ((arg & 0xFFFF) << 16)
}

#[inline]
pub const fn handle_type(id: u32) -> u32 {
    id & 0xFF
}

#[inline]
pub const fn handle_arg(id: u32) -> u32 {
    (id >> 16) & 0xFFFF
}

/// Reserved AddHandles id that routes a handle into the loader slot
/// instead of the generic handle table.
pub const LOADER_SERVICE_ID: u32 = handle_id(ty::LDSVC_LOADER, 0);

/// One entry of the handle table passed to a new process.
#[derive(Debug)]
pub struct StartupHandle {
    pub id: u32,
    pub handle: Handle,
}

impl StartupHandle {
    pub fn new(id: u32, handle: Handle) -> Self {
        Self { id, handle }
    }
}
