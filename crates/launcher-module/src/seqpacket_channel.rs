//! `SeqpacketChannel`: default `Channel` implementation.
//!
//! An `AF_UNIX` `SOCK_SEQPACKET` socket keeps message boundaries and
//! passes descriptors as `SCM_RIGHTS` ancillary data, which is exactly the
//! bytes-plus-handles shape of a protocol message. Received descriptors
//! arrive close-on-exec.
//!
//! A zero-length read is end-of-stream only when the peer has hung up.
//! An empty datagram from a live peer is handed up as an empty message,
//! which the codec then rejects as a short header.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use launcher_core::channel::Channel;
use launcher_core::error::ChannelError;
use launcher_core::handle::Handle;
use launcher_core::message::{RawMessage, MAX_MESSAGE_BYTES, MAX_MESSAGE_HANDLES};

use crate::sys::retry_eintr;

pub struct SeqpacketChannel {
    fd: OwnedFd,
    buf: Vec<u8>,
}

impl SeqpacketChannel {
    /// Wrap a connected seqpacket socket. The socket should be
    /// non-blocking; `read()` never waits regardless.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd, buf: vec![0u8; MAX_MESSAGE_BYTES] }
    }

    /// A connected, non-blocking pair.
    pub fn pair() -> Result<(Self, Self), ChannelError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| ChannelError::Os(e as i32))?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn into_inner(self) -> OwnedFd {
        self.fd
    }
}

impl Channel for SeqpacketChannel {
    fn read(&mut self) -> Result<Option<RawMessage>, ChannelError> {
        recv_message(self.fd.as_fd(), &mut self.buf, libc::MSG_DONTWAIT)
    }

    fn write(&mut self, msg: RawMessage) -> Result<(), ChannelError> {
        send_message(self.fd.as_fd(), msg, libc::MSG_DONTWAIT)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Receive one message. `Ok(None)` when `flags` includes `MSG_DONTWAIT`
/// and nothing is queued.
pub fn recv_message(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
    flags: libc::c_int,
) -> Result<Option<RawMessage>, ChannelError> {
    let space = cmsg_space(MAX_MESSAGE_HANDLES);
    let mut control = vec![0u64; space.div_ceil(8)];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = space as _;

    let n = match retry_eintr(|| unsafe {
        libc::recvmsg(fd.as_raw_fd(), &mut hdr, flags | libc::MSG_CMSG_CLOEXEC)
    }) {
        Ok(n) => n as usize,
        Err(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(None),
        Err(libc::ECONNRESET) => return Err(ChannelError::PeerClosed),
        Err(e) => return Err(ChannelError::Os(e)),
    };

    // Take ownership of every delivered descriptor before anything can
    // fail, so an error path closes them instead of leaking them.
    let handles = unsafe { collect_rights(&hdr) };

    if hdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(ChannelError::Truncated);
    }
    if n == 0 && handles.is_empty() && peer_hung_up(fd) {
        return Err(ChannelError::PeerClosed);
    }
    Ok(Some(RawMessage::new(buf[..n].to_vec(), handles)))
}

/// Send one message. The message's handles are closed locally once the
/// kernel has queued duplicates for the peer.
pub fn send_message(
    fd: BorrowedFd<'_>,
    msg: RawMessage,
    flags: libc::c_int,
) -> Result<(), ChannelError> {
    if msg.handles.len() > MAX_MESSAGE_HANDLES {
        return Err(ChannelError::TooManyHandles(msg.handles.len()));
    }
    let fds: Vec<RawFd> = msg.handles.iter().map(AsRawFd::as_raw_fd).collect();
    send_raw(fd, &msg.bytes, &fds, flags)
    // `msg.handles` drops here, closing the local copies.
}

/// `sendmsg` with `fds` as `SCM_RIGHTS`; no limit checks.
fn send_raw(
    fd: BorrowedFd<'_>,
    bytes: &[u8],
    fds: &[RawFd],
    flags: libc::c_int,
) -> Result<(), ChannelError> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;

    let space = cmsg_space(fds.len());
    let mut control = vec![0u64; space.div_ceil(8)];
    if !fds.is_empty() {
        hdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        hdr.msg_controllen = space as _;
        let data_len = std::mem::size_of_val(fds);
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                data_len,
            );
        }
    }

    match retry_eintr(|| unsafe {
        libc::sendmsg(fd.as_raw_fd(), &hdr, flags | libc::MSG_NOSIGNAL)
    }) {
        Ok(_) => Ok(()),
        Err(libc::EPIPE) | Err(libc::ECONNRESET) => Err(ChannelError::PeerClosed),
        Err(e) => Err(ChannelError::Os(e)),
    }
}

/// Zero-timeout poll for a hang-up on a seqpacket socket.
fn peer_hung_up(fd: BorrowedFd<'_>) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLRDHUP,
        revents: 0,
    };
    match retry_eintr(|| unsafe { libc::poll(&mut pfd, 1, 0) as isize }) {
        Ok(0) => false,
        Ok(_) => pfd.revents & (libc::POLLRDHUP | libc::POLLHUP | libc::POLLERR) != 0,
        Err(_) => true,
    }
}

fn cmsg_space(nfds: usize) -> usize {
    let bytes = (nfds.max(1) * std::mem::size_of::<RawFd>()) as u32;
    unsafe { libc::CMSG_SPACE(bytes) as usize }
}

/// # Safety
/// `hdr` must describe a buffer just filled by `recvmsg`.
unsafe fn collect_rights(hdr: &libc::msghdr) -> Vec<Handle> {
    let mut out = Vec::new();
    let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg) as *const RawFd;
            let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            let count = payload / std::mem::size_of::<RawFd>();
            for i in 0..count {
                let raw = std::ptr::read_unaligned(data.add(i));
                out.push(OwnedFd::from_raw_fd(raw));
            }
        }
        cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, Write};

    #[test]
    fn test_empty_read_is_none() {
        let (mut a, _b) = SeqpacketChannel::pair().unwrap();
        assert!(a.read().unwrap().is_none());
    }

    #[test]
    fn test_boundaries_preserved() {
        let (mut a, mut b) = SeqpacketChannel::pair().unwrap();
        a.write(RawMessage::new(b"first".to_vec(), Vec::new())).unwrap();
        a.write(RawMessage::new(b"second".to_vec(), Vec::new())).unwrap();
        assert_eq!(b.read().unwrap().unwrap().bytes, b"first");
        assert_eq!(b.read().unwrap().unwrap().bytes, b"second");
        assert!(b.read().unwrap().is_none());
    }

    #[test]
    fn test_handles_travel_with_message() {
        let (mut a, mut b) = SeqpacketChannel::pair().unwrap();
        let mut tmp = tempfile();
        tmp.write_all(b"payload").unwrap();
        a.write(RawMessage::new(b"h".to_vec(), vec![tmp.into()])).unwrap();

        let msg = b.read().unwrap().unwrap();
        assert_eq!(msg.handles.len(), 1);
        let mut f = File::from(msg.handles.into_iter().next().unwrap());
        f.rewind().unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        assert_eq!(s, "payload");
    }

    #[test]
    fn test_queued_messages_survive_peer_close() {
        let (mut a, mut b) = SeqpacketChannel::pair().unwrap();
        a.write(RawMessage::new(b"last words".to_vec(), Vec::new())).unwrap();
        drop(a);
        assert_eq!(b.read().unwrap().unwrap().bytes, b"last words");
        assert_eq!(b.read().unwrap_err(), ChannelError::PeerClosed);
    }

    #[test]
    fn test_write_to_closed_peer() {
        let (mut a, b) = SeqpacketChannel::pair().unwrap();
        drop(b);
        let err = a.write(RawMessage::new(b"x".to_vec(), Vec::new())).unwrap_err();
        assert_eq!(err, ChannelError::PeerClosed);
    }

    #[test]
    fn test_empty_message_from_live_peer() {
        let (mut a, mut b) = SeqpacketChannel::pair().unwrap();
        a.write(RawMessage::new(Vec::new(), Vec::new())).unwrap();
        let msg = b.read().unwrap().unwrap();
        assert!(msg.bytes.is_empty());
        assert!(msg.handles.is_empty());
        drop(a);
        assert_eq!(b.read().unwrap_err(), ChannelError::PeerClosed);
    }

    /// Non-blocking pipe; returns (read end, write end).
    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// True once every copy of the pipe's write end is closed.
    fn writers_gone(r: &OwnedFd) -> bool {
        let mut byte = 0u8;
        let n = unsafe { libc::read(r.as_raw_fd(), &mut byte as *mut u8 as *mut libc::c_void, 1) };
        n == 0
    }

    #[test]
    fn test_oversized_message_truncated() {
        let (a, mut b) = SeqpacketChannel::pair().unwrap();
        let (r, w) = pipe();
        let big = vec![7u8; MAX_MESSAGE_BYTES + 1];
        send_message(a.fd.as_fd(), RawMessage::new(big, vec![w]), libc::MSG_DONTWAIT).unwrap();

        assert_eq!(b.read().unwrap_err(), ChannelError::Truncated);
        // The descriptor that rode along was closed, not leaked.
        assert!(writers_gone(&r));
        assert!(b.read().unwrap().is_none());
    }

    #[test]
    fn test_too_many_handles_truncated() {
        let (a, mut b) = SeqpacketChannel::pair().unwrap();
        let (r, w) = pipe();
        let copies: Vec<OwnedFd> =
            (0..=MAX_MESSAGE_HANDLES).map(|_| w.try_clone().unwrap()).collect();
        drop(w);

        let handles: Vec<OwnedFd> = copies.iter().map(|fd| fd.try_clone().unwrap()).collect();
        let err = send_message(
            a.fd.as_fd(),
            RawMessage::new(b"h".to_vec(), handles),
            libc::MSG_DONTWAIT,
        )
        .unwrap_err();
        assert_eq!(err, ChannelError::TooManyHandles(MAX_MESSAGE_HANDLES + 1));

        // Bypass the sender-side check to exercise the receiver.
        let raw: Vec<RawFd> = copies.iter().map(AsRawFd::as_raw_fd).collect();
        send_raw(a.fd.as_fd(), b"h", &raw, libc::MSG_DONTWAIT).unwrap();
        drop(copies);

        assert_eq!(b.read().unwrap_err(), ChannelError::Truncated);
        assert!(writers_gone(&r));
    }

    fn tempfile() -> File {
        let fd = unsafe { libc::memfd_create(c"seqpacket-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        unsafe { File::from_raw_fd(fd) }
    }
}
