//! Protocol message types.
//!
//! A `RawMessage` is what travels on a channel; a `Request` is what the
//! codec makes of it. Requests are decoded once and matched exhaustively
//! by the dispatcher, with `Unknown` standing in for any ordinal this
//! build does not handle.

use std::ffi::CString;

use crate::handle::Handle;
use crate::status::Status;

/// Bytes in a message header: txid, reserved, flags, ordinal.
pub const HEADER_LEN: usize = 16;

/// Largest message, in bytes, a channel accepts.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Most handles one message may carry.
pub const MAX_MESSAGE_HANDLES: usize = 64;

pub mod ordinal {
    pub const LAUNCH: u32 = 1;
    pub const ADD_ARGS: u32 = 2;
    pub const ADD_ENVIRONS: u32 = 3;
    pub const ADD_NAMES: u32 = 4;
    pub const ADD_HANDLES: u32 = 5;

    pub fn name(ordinal: u32) -> &'static str {
        match ordinal {
            LAUNCH => "Launch",
            ADD_ARGS => "AddArgs",
            ADD_ENVIRONS => "AddEnvirons",
            ADD_NAMES => "AddNames",
            ADD_HANDLES => "AddHandles",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub txid: u32,
    pub flags: u32,
    pub ordinal: u32,
}

impl Header {
    pub fn new(txid: u32, ordinal: u32) -> Self {
        Self { txid, flags: 0, ordinal }
    }
}

/// Bytes plus the handles attached to them, in attachment order.
#[derive(Debug, Default)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl RawMessage {
    pub fn new(bytes: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { bytes, handles }
    }
}

#[derive(Debug)]
pub struct NameInfo {
    pub path: CString,
    pub directory: Handle,
}

#[derive(Debug)]
pub struct HandleInfo {
    pub handle: Handle,
    pub id: u32,
}

#[derive(Debug)]
pub struct LaunchInfo {
    pub executable: Handle,
    pub job: Handle,
    pub name: CString,
}

#[derive(Debug)]
pub enum Request {
    Launch(LaunchInfo),
    AddArgs(Vec<CString>),
    AddEnvirons(Vec<CString>),
    AddNames(Vec<NameInfo>),
    AddHandles(Vec<HandleInfo>),
    Unknown { ordinal: u32 },
}

impl Request {
    pub fn ordinal(&self) -> u32 {
        match self {
            Request::Launch(_) => ordinal::LAUNCH,
            Request::AddArgs(_) => ordinal::ADD_ARGS,
            Request::AddEnvirons(_) => ordinal::ADD_ENVIRONS,
            Request::AddNames(_) => ordinal::ADD_NAMES,
            Request::AddHandles(_) => ordinal::ADD_HANDLES,
            Request::Unknown { ordinal } => *ordinal,
        }
    }

    pub fn name(&self) -> &'static str {
        ordinal::name(self.ordinal())
    }
}

/// Outcome of one Launch, moved into the response and then gone.
#[derive(Debug)]
pub struct LaunchResult {
    pub status: Status,
    pub process: Option<Handle>,
    pub root_vmar: Option<Handle>,
    pub error_message: Option<String>,
}

impl LaunchResult {
    pub fn started(process: Handle, root_vmar: Handle) -> Self {
        Self {
            status: Status::OK,
            process: Some(process),
            root_vmar: Some(root_vmar),
            error_message: None,
        }
    }

    pub fn failed(status: Status, error_message: Option<String>) -> Self {
        Self { status, process: None, root_vmar: None, error_message }
    }
}
