//! Process signals as a pollable descriptor.
//!
//! `SIGCHLD`, `SIGINT` and `SIGTERM` are blocked on the calling thread and
//! delivered through a non-blocking signalfd instead, so the service loop
//! can register them with the reactor like any connection. Call `new()`
//! before spawning other threads so they inherit the mask.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use launcher_core::status::Status;
use launcher_core::{kdebug, ktrace};

use crate::sys::status_from_errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// At least one child changed state; reap with `reap_children()`.
    ChildExited,
    /// SIGINT or SIGTERM.
    Shutdown(i32),
    Other(i32),
}

impl SignalEvent {
    fn from_signo(signo: i32) -> Self {
        match signo {
            libc::SIGCHLD => SignalEvent::ChildExited,
            libc::SIGINT | libc::SIGTERM => SignalEvent::Shutdown(signo),
            other => SignalEvent::Other(other),
        }
    }
}

pub struct SignalSource {
    fd: SignalFd,
}

impl SignalSource {
    pub fn new() -> Result<Self, Status> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().map_err(|e| status_from_errno(e as i32))?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| status_from_errno(e as i32))?;
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Read every pending signal.
    pub fn drain(&mut self) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => events.push(SignalEvent::from_signo(info.ssi_signo as i32)),
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    kdebug!("signalfd read failed: {}", e);
                    break;
                }
            }
        }
        events
    }
}

/// Reap every exited child without blocking. Returns how many were reaped.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                ktrace!("pid {} exited with {}", pid, code);
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                ktrace!("pid {} killed by {}", pid, sig);
                reaped += 1;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                kdebug!("waitpid failed: {}", e);
                break;
            }
        }
    }
    reaped
}
