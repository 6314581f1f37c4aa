//! Loader service client.
//!
//! The loader service resolves names to executable objects. The launcher
//! uses it for one thing: turning a dynamic image's `PT_INTERP` path into
//! a descriptor for the interpreter. The exchange is synchronous and has
//! no timeout, so a loader that never answers stalls the caller; this is
//! the only blocking call on the launch path.
//!
//! ```text
//! LoadObject request := header(ordinal = 0x1000) string(name)
//! LoadObject reply   := header(ordinal = 0x1000) i32(status) handle(object)
//! ```

use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, BorrowedFd};

use launcher_core::error::{BuildError, ChannelError, DecodeError};
use launcher_core::handle::Handle;
use launcher_core::message::{Header, RawMessage, MAX_MESSAGE_BYTES};
use launcher_core::status::Status;

use crate::seqpacket_channel::{recv_message, send_message};
use crate::sys::{errno, status_from_errno};
use crate::wire_codec::{Decoder, Encoder, MAX_STRING};

pub const LOAD_OBJECT: u32 = 0x1000;

/// Requests on a loader channel are strictly one at a time.
const LOADER_TXID: u32 = 1;

fn loader_error(status: Status, what: impl std::fmt::Display) -> BuildError {
    BuildError::new(status, format!("loader service: {}", what))
}

fn channel_status(e: &ChannelError) -> Status {
    match e {
        ChannelError::PeerClosed => Status::PEER_CLOSED,
        ChannelError::Truncated => Status::BUFFER_TOO_SMALL,
        ChannelError::TooManyHandles(_) => Status::NO_RESOURCES,
        ChannelError::Os(e) => status_from_errno(*e),
    }
}

/// Block until `fd` reports one of `events`. No timeout.
fn wait_fd(fd: BorrowedFd<'_>, events: libc::c_short) -> Result<(), ChannelError> {
    let mut pfd = libc::pollfd { fd: fd.as_raw_fd(), events, revents: 0 };
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, -1) };
        if n > 0 {
            return Ok(());
        }
        if n < 0 && errno() != libc::EINTR {
            return Err(ChannelError::Os(errno()));
        }
    }
}

fn send_blocking(fd: BorrowedFd<'_>, msg: RawMessage) -> Result<(), ChannelError> {
    wait_fd(fd, libc::POLLOUT)?;
    send_message(fd, msg, 0)
}

fn recv_blocking(fd: BorrowedFd<'_>) -> Result<RawMessage, ChannelError> {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    loop {
        if let Some(msg) = recv_message(fd, &mut buf, libc::MSG_DONTWAIT)? {
            return Ok(msg);
        }
        wait_fd(fd, libc::POLLIN)?;
    }
}

fn decode_reply(d: &mut Decoder<'_>) -> Result<(Status, Option<Handle>), DecodeError> {
    let header = d.header()?;
    if header.ordinal != LOAD_OBJECT {
        return Err(DecodeError::Mismatch {
            field: "ordinal",
            expected: LOAD_OBJECT,
            actual: header.ordinal,
        });
    }
    if header.txid != LOADER_TXID {
        return Err(DecodeError::Mismatch {
            field: "txid",
            expected: LOADER_TXID,
            actual: header.txid,
        });
    }
    let status = Status(d.i32()?);
    let object = d.opt_handle()?;
    Ok((status, object))
}

/// Ask the loader behind `loader` for the object called `name`.
pub fn load_object(loader: BorrowedFd<'_>, name: &CStr) -> Result<Handle, BuildError> {
    let mut enc = Encoder::new(&Header::new(LOADER_TXID, LOAD_OBJECT));
    enc.put_string(name);
    let request = enc
        .finish()
        .map_err(|e| loader_error(Status::INVALID_ARGS, e))?;

    send_blocking(loader, request).map_err(|e| loader_error(channel_status(&e), e))?;
    let reply = recv_blocking(loader).map_err(|e| loader_error(channel_status(&e), e))?;

    let RawMessage { bytes, handles } = reply;
    let mut d = Decoder::new(&bytes, handles);
    let (status, object) = decode_reply(&mut d).map_err(|e| loader_error(Status::IO, e))?;
    d.finish().map_err(|e| loader_error(Status::IO, e))?;

    if !status.is_ok() {
        return Err(loader_error(
            status,
            format_args!("LoadObject({}) failed", name.to_string_lossy()),
        ));
    }
    object.ok_or_else(|| {
        loader_error(
            Status::NOT_FOUND,
            format_args!("LoadObject({}) returned no object", name.to_string_lossy()),
        )
    })
}

fn decode_request(d: &mut Decoder<'_>) -> Result<(Header, CString), DecodeError> {
    let header = d.header()?;
    let name = d.string(MAX_STRING)?;
    Ok((header, name))
}

/// Serve one LoadObject request on `fd`, resolving names with `resolve`.
/// Blocks until a request arrives; `Err(PeerClosed)` once the client is
/// gone.
pub fn serve_one<F>(fd: BorrowedFd<'_>, mut resolve: F) -> Result<(), ChannelError>
where
    F: FnMut(&CStr) -> Result<Handle, Status>,
{
    let RawMessage { bytes, handles } = recv_blocking(fd)?;
    let mut d = Decoder::new(&bytes, handles);
    let (header, name) = decode_request(&mut d).map_err(|_| ChannelError::Truncated)?;

    let mut enc = Encoder::new(&Header::new(header.txid, LOAD_OBJECT));
    match resolve(&name) {
        Ok(object) => {
            enc.put_i32(Status::OK.into_raw());
            enc.put_handle(Some(object));
        }
        Err(status) => {
            enc.put_i32(status.into_raw());
            enc.put_handle(None);
        }
    }
    let reply = enc.finish().map_err(|_| ChannelError::TooManyHandles(1))?;
    send_blocking(fd, reply)
}
