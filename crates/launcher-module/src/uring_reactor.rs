//! `UringReactor`: default `Reactor` implementation.
//!
//! Each registration is a one-shot `IORING_OP_POLL_ADD` whose user_data is
//! the caller's key. `wait()` submits whatever was registered since the
//! last call and blocks in a single `io_uring_enter()` until at least one
//! poll completes.

use std::os::fd::RawFd;

use io_uring::{opcode, types, IoUring};

use launcher_core::error::WaitError;
use launcher_core::reactor::{Reactor, Readiness, SignalPacket, Signals};

/// Configuration for UringReactor.
pub struct UringReactorConfig {
    /// Number of SQ entries. Must be power of 2.
    pub sq_entries: u32,
    /// Messages a handler may drain per readiness event.
    pub batch: usize,
}

impl Default for UringReactorConfig {
    fn default() -> Self {
        Self { sq_entries: 256, batch: 64 }
    }
}

pub struct UringReactor {
    ring: IoUring,
    batch: usize,
    inflight: usize,
}

impl UringReactor {
    pub fn new(config: UringReactorConfig) -> Result<Self, WaitError> {
        let ring = IoUring::builder()
            .build(config.sq_entries)
            .map_err(|e| WaitError::Submit(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self { ring, batch: config.batch.max(1), inflight: 0 })
    }

    /// Registrations submitted and not yet completed.
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    fn poll_mask(signals: Signals) -> u32 {
        let mut mask = 0u32;
        if signals.contains(Signals::READABLE) {
            mask |= libc::POLLIN as u32;
        }
        if signals.contains(Signals::PEER_CLOSED) {
            mask |= libc::POLLRDHUP as u32;
        }
        mask
    }

    fn observed(revents: u32) -> Signals {
        let mut observed = Signals::NONE;
        if revents & libc::POLLIN as u32 != 0 {
            observed = observed | Signals::READABLE;
        }
        if revents & (libc::POLLHUP | libc::POLLRDHUP | libc::POLLERR) as u32 != 0 {
            observed = observed | Signals::PEER_CLOSED;
        }
        observed
    }
}

impl Reactor for UringReactor {
    fn begin_wait(&mut self, key: u64, fd: RawFd, signals: Signals) -> Result<(), WaitError> {
        let sqe = opcode::PollAdd::new(types::Fd(fd), Self::poll_mask(signals))
            .build()
            .user_data(key);

        // Safety: PollAdd references no user memory.
        unsafe {
            if self.ring.submission().push(&sqe).is_err() {
                // SQ full: hand what is queued to the kernel and retry once.
                self.ring
                    .submit()
                    .map_err(|e| WaitError::Submit(e.raw_os_error().unwrap_or(-1)))?;
                self.ring.submission().push(&sqe).map_err(|_| WaitError::QueueFull)?;
            }
        }
        self.inflight += 1;
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<Readiness>) -> Result<(), WaitError> {
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(WaitError::Submit(e.raw_os_error().unwrap_or(-1))),
        }

        for cqe in self.ring.completion() {
            self.inflight = self.inflight.saturating_sub(1);
            let res = cqe.result();
            let result = if res < 0 {
                Err(WaitError::Os(-res))
            } else {
                Ok(SignalPacket { observed: Self::observed(res as u32), count: self.batch })
            };
            out.push(Readiness { key: cqe.user_data(), result });
        }
        Ok(())
    }
}
