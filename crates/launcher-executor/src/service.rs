//! `Service`: listener, connection slab and the reactor loop.
//!
//! ```text
//! loop {
//!     1. Wait for completions
//!     2. For each completion:
//!          LISTENER_KEY → accept every pending client, start a Launcher
//!          SIGNAL_KEY   → reap children / stop on SIGINT, SIGTERM
//!          conn key     → Launcher::on_ready
//!     3. Free slots whose Launcher reported an error
//! }
//! ```
//!
//! Everything runs on the calling thread. Connection keys carry a slot
//! generation, so a completion that arrives after its slot was reused is
//! ignored.

use std::cell::RefCell;
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use launcher_core::builder::BuilderFactory;
use launcher_core::error::WaitError;
use launcher_core::reactor::{Reactor, Readiness, Signals};
use launcher_core::status::Status;
use launcher_core::{kdebug, kinfo, kwarn};

use launcher_module::seqpacket_channel::SeqpacketChannel;
use launcher_module::signals::{reap_children, SignalEvent, SignalSource};
use launcher_module::sys::errno;
use launcher_module::uring_reactor::UringReactor;
use launcher_module::wire_codec::WireCodec;

use crate::config::LauncherConfig;
use crate::launcher::{LaunchStats, Launcher};

pub const LISTENER_KEY: u64 = u64::MAX;
pub const SIGNAL_KEY: u64 = u64::MAX - 1;

const GEN_MASK: u32 = 0x7FFF_FFFF;

// ── Errors ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    Socket(i32),
    Bind { path: PathBuf, errno: i32 },
    Listen(i32),
    Reactor(WaitError),
    Signals(Status),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = |e: &i32| std::io::Error::from_raw_os_error(*e);
        match self {
            Self::Socket(e) => write!(f, "socket: {}", os(e)),
            Self::Bind { path, errno } => write!(f, "bind {}: {}", path.display(), os(errno)),
            Self::Listen(e) => write!(f, "listen: {}", os(e)),
            Self::Reactor(e) => write!(f, "reactor: {}", e),
            Self::Signals(s) => write!(f, "signal source: {}", s),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<WaitError> for ServiceError {
    fn from(e: WaitError) -> Self {
        Self::Reactor(e)
    }
}

// ── Connection slab ──

struct Slot<T> {
    gen: u32,
    value: Option<T>,
}

/// Fixed-capacity slab addressed by `(generation << 32) | index` keys.
pub(crate) struct ConnSlab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> ConnSlab<T> {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| Slot { gen: 0, value: None }).collect(),
            free: (0..max).rev().collect(),
        }
    }

    fn split(key: u64) -> (u32, usize) {
        ((key >> 32) as u32, (key & 0xFFFF_FFFF) as usize)
    }

    /// Reserve a slot and fill it with `make(key)`. `None` when full.
    pub(crate) fn alloc(&mut self, make: impl FnOnce(u64) -> T) -> Option<u64> {
        let idx = self.free.pop()?;
        let slot = &mut self.slots[idx];
        slot.gen = (slot.gen + 1) & GEN_MASK;
        let key = ((slot.gen as u64) << 32) | idx as u64;
        slot.value = Some(make(key));
        Some(key)
    }

    pub(crate) fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let (gen, idx) = Self::split(key);
        let slot = self.slots.get_mut(idx)?;
        if slot.gen != gen {
            return None;
        }
        slot.value.as_mut()
    }

    pub(crate) fn remove(&mut self, key: u64) -> Option<T> {
        let (gen, idx) = Self::split(key);
        let slot = self.slots.get_mut(idx)?;
        if slot.gen != gen {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(idx);
        Some(value)
    }

    pub(crate) fn keys(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(idx, s)| ((s.gen as u64) << 32) | idx as u64)
            .collect()
    }

    pub(crate) fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ── Stats ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub launches_ok: u64,
    pub launches_failed: u64,
    pub reaped: u64,
}

impl Stats {
    fn absorb(&mut self, launches: LaunchStats) {
        self.launches_ok += launches.ok;
        self.launches_failed += launches.failed;
    }

    fn log(&self) {
        kinfo!(
            "accepted={} rejected={} closed={} launches_ok={} launches_failed={} reaped={}",
            self.accepted,
            self.rejected,
            self.closed,
            self.launches_ok,
            self.launches_failed,
            self.reaped,
        );
    }
}

// ── Listener ──

fn bind_listener(path: &Path, backlog: i32) -> Result<OwnedFd, ServiceError> {
    let bind_err = |e| ServiceError::Bind { path: path.to_path_buf(), errno: e };

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(bind_err(libc::ENAMETOOLONG));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(ServiceError::Socket(errno()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // A socket left behind by an earlier run; anything else stays.
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            let _ = std::fs::remove_file(path);
        }
    }

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(bind_err(errno()));
    }
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } < 0 {
        return Err(ServiceError::Listen(errno()));
    }
    Ok(fd)
}

// ── Service ──

type Conn<F> = Launcher<SeqpacketChannel, WireCodec, F>;

pub struct Service<F: BuilderFactory, R: Reactor = UringReactor> {
    config: LauncherConfig,
    listener: OwnedFd,
    reactor: R,
    signals: SignalSource,
    factory: Rc<F>,
    conns: ConnSlab<Conn<F>>,
    closed: Rc<RefCell<Vec<u64>>>,
    stats: Stats,
    running: bool,
}

impl<F: BuilderFactory> Service<F> {
    /// Create the listener, the reactor and the signal source. Signals are
    /// blocked on the calling thread, which must be the one that calls
    /// `run()`.
    pub fn bind(config: LauncherConfig, factory: F) -> Result<Self, ServiceError> {
        let reactor = UringReactor::new(config.reactor_config())?;
        Self::with_reactor(config, factory, reactor)
    }
}

impl<F: BuilderFactory, R: Reactor> Service<F, R> {
    /// `bind()` with a caller-supplied reactor.
    pub fn with_reactor(config: LauncherConfig, factory: F, reactor: R) -> Result<Self, ServiceError> {
        let signals = SignalSource::new().map_err(ServiceError::Signals)?;
        let listener = bind_listener(&config.socket_path, config.backlog)?;
        kinfo!("listening on {}", config.socket_path.display());

        Ok(Self {
            conns: ConnSlab::new(config.max_connections),
            config,
            listener,
            reactor,
            signals,
            factory: Rc::new(factory),
            closed: Rc::new(RefCell::new(Vec::new())),
            stats: Stats::default(),
            running: false,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Serve until SIGINT or SIGTERM. Connections are torn down and the
    /// socket file removed on every exit path, including reactor failure.
    pub fn run(&mut self) -> Result<Stats, ServiceError> {
        let result = self.serve();
        self.shutdown();
        result.map(|()| self.stats)
    }

    fn serve(&mut self) -> Result<(), ServiceError> {
        self.reactor.begin_wait(LISTENER_KEY, self.listener.as_raw_fd(), Signals::READABLE)?;
        self.reactor.begin_wait(SIGNAL_KEY, self.signals.raw_fd(), Signals::READABLE)?;
        self.running = true;

        let mut ready: Vec<Readiness> = Vec::with_capacity(self.config.max_batch);
        while self.running {
            // ── Step 1: wait ──
            ready.clear();
            self.reactor.wait(&mut ready)?;

            // ── Step 2: route ──
            for Readiness { key, result } in ready.drain(..) {
                match key {
                    LISTENER_KEY => {
                        if let Err(e) = result {
                            kwarn!("listener wait failed: {}", e);
                        }
                        self.accept_all();
                        self.reactor.begin_wait(LISTENER_KEY, self.listener.as_raw_fd(), Signals::READABLE)?;
                    }
                    SIGNAL_KEY => {
                        self.handle_signals();
                        self.reactor.begin_wait(SIGNAL_KEY, self.signals.raw_fd(), Signals::READABLE)?;
                    }
                    key => {
                        if let Some(conn) = self.conns.get_mut(key) {
                            conn.on_ready(&mut self.reactor, result);
                        }
                    }
                }
                // ── Step 3: free closed connections ──
                self.free_closed();
            }
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                match errno() {
                    libc::EAGAIN => break,
                    libc::EINTR | libc::ECONNABORTED => continue,
                    e => {
                        kwarn!("accept: {}", std::io::Error::from_raw_os_error(e));
                        break;
                    }
                }
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            self.stats.accepted += 1;

            let factory = Rc::clone(&self.factory);
            let closed = Rc::clone(&self.closed);
            let key = self.conns.alloc(move |key| {
                let mut conn = Launcher::new(key, SeqpacketChannel::new(fd), WireCodec::new(), factory);
                conn.set_error_handler(move |_| closed.borrow_mut().push(key));
                conn
            });
            match key {
                Some(key) => {
                    kdebug!("conn {:#x}: accepted", key);
                    if let Some(conn) = self.conns.get_mut(key) {
                        conn.start(&mut self.reactor);
                    }
                }
                None => {
                    self.stats.rejected += 1;
                    kwarn!("connection limit {} reached; rejecting client", self.config.max_connections);
                }
            }
        }
    }

    fn handle_signals(&mut self) {
        for event in self.signals.drain() {
            match event {
                SignalEvent::ChildExited => self.stats.reaped += reap_children() as u64,
                SignalEvent::Shutdown(signo) => {
                    kinfo!("signal {}: shutting down", signo);
                    self.running = false;
                }
                SignalEvent::Other(signo) => kdebug!("ignoring signal {}", signo),
            }
        }
    }

    fn free_closed(&mut self) {
        let keys: Vec<u64> = self.closed.borrow_mut().drain(..).collect();
        for key in keys {
            if let Some(conn) = self.conns.remove(key) {
                self.stats.absorb(conn.stats());
                self.stats.closed += 1;
            }
        }
    }

    fn shutdown(&mut self) {
        self.running = false;
        kinfo!("closing {} connections", self.conns.active());
        for key in self.conns.keys() {
            if let Some(conn) = self.conns.get_mut(key) {
                conn.close();
            }
        }
        self.free_closed();
        self.stats.reaped += reap_children() as u64;
        let _ = std::fs::remove_file(&self.config.socket_path);
        self.stats.log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::ffi::CString;
    use std::fs::File;
    use std::os::fd::{AsFd, RawFd};
    use std::os::unix::thread::JoinHandleExt;
    use std::sync::mpsc;

    use launcher_core::error::ChannelError;
    use launcher_core::message::{LaunchInfo, Request, MAX_MESSAGE_BYTES};
    use launcher_core::reactor::SignalPacket;
    use launcher_module::linux_spawn::LinuxSpawner;
    use launcher_module::seqpacket_channel::{recv_message, send_message};

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("launcher-{}-{}.sock", tag, std::process::id()))
    }

    #[test]
    fn test_slab_generations() {
        let mut slab: ConnSlab<&str> = ConnSlab::new(1);
        let a = slab.alloc(|_| "a").unwrap();
        assert!(slab.alloc(|_| "full").is_none());
        assert_eq!(slab.active(), 1);
        assert_eq!(slab.remove(a), Some("a"));

        let b = slab.alloc(|_| "b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a & 0xFFFF_FFFF, b & 0xFFFF_FFFF);
        // Stale key from the previous occupant.
        assert!(slab.get_mut(a).is_none());
        assert!(slab.remove(a).is_none());
        assert_eq!(slab.get_mut(b), Some(&mut "b"));
        assert_eq!(slab.keys(), vec![b]);
    }

    #[test]
    fn test_slab_keys_never_hit_reserved() {
        let mut slab: ConnSlab<()> = ConnSlab::new(4);
        for _ in 0..16 {
            let key = slab.alloc(|_| ()).unwrap();
            assert!(key < SIGNAL_KEY);
            slab.remove(key);
        }
    }

    #[test]
    fn test_bind_missing_directory() {
        let path = PathBuf::from("/nonexistent-launcher-dir/launcher.sock");
        let err = bind_listener(&path, 4).unwrap_err();
        assert_eq!(err, ServiceError::Bind { path, errno: libc::ENOENT });
    }

    #[test]
    fn test_bind_replaces_stale_socket_only() {
        let path = temp_socket("stale");
        let first = bind_listener(&path, 4).unwrap();
        drop(first);
        // The file is still there; a second bind must replace it.
        let second = bind_listener(&path, 4).unwrap();
        drop(second);
        std::fs::remove_file(&path).unwrap();

        let regular = temp_socket("regular");
        File::create(&regular).unwrap();
        let err = bind_listener(&regular, 4).unwrap_err();
        assert!(matches!(err, ServiceError::Bind { errno: libc::EADDRINUSE, .. }));
        std::fs::remove_file(&regular).unwrap();
    }

    fn connect(path: &Path) -> OwnedFd {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
        assert!(fd >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(path.as_os_str().as_bytes()) {
            *dst = *src as libc::c_char;
        }
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        assert_eq!(ret, 0, "{}", std::io::Error::last_os_error());
        fd
    }

    type Server = std::thread::JoinHandle<Option<Stats>>;

    /// Run a service on its own thread. `None` when io_uring is unavailable.
    fn serve(config: LauncherConfig) -> Option<Server> {
        let (tx, rx) = mpsc::channel();
        let server = std::thread::spawn(move || {
            let mut service = match Service::bind(config, LinuxSpawner::new()) {
                Ok(s) => s,
                Err(e) => {
                    // Sandboxes commonly forbid io_uring_setup.
                    tx.send(Err(e)).unwrap();
                    return None;
                }
            };
            tx.send(Ok(())).unwrap();
            Some(service.run().unwrap())
        });

        match rx.recv().unwrap() {
            Ok(()) => Some(server),
            Err(e) => {
                eprintln!("skipping: {}", e);
                server.join().unwrap();
                None
            }
        }
    }

    fn stop(server: Server) -> Stats {
        let ret = unsafe { libc::pthread_kill(server.as_pthread_t(), libc::SIGTERM) };
        assert_eq!(ret, 0);
        server.join().unwrap().unwrap()
    }

    #[test]
    fn test_serves_launch_and_stops_on_sigterm() {
        let path = temp_socket("serve");
        let config = LauncherConfig::new().socket_path(&path).max_connections(4).sq_entries(16);
        let Some(server) = serve(config) else { return };

        let client = connect(&path);
        let codec = WireCodec::new();
        let send = |txid, req| {
            let msg = codec.encode_request(txid, req).unwrap();
            send_message(client.as_fd(), msg, 0).unwrap();
        };
        send(1, Request::AddArgs(vec![CString::new("/bin/true").unwrap()]));
        send(2, Request::Launch(LaunchInfo {
            executable: File::open("/bin/true").unwrap().into(),
            job: File::open(std::env::temp_dir()).unwrap().into(),
            name: CString::new("true").unwrap(),
        }));

        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        let reply = recv_message(client.as_fd(), &mut buf, 0).unwrap().unwrap();
        let (header, result) = codec.decode_launch_response(reply).unwrap();
        assert_eq!(header.txid, 2);
        assert_eq!(result.status, Status::INVALID_ARGS);
        assert!(result.error_message.unwrap().contains("need loader service"));

        // Unknown ordinal: the service drops the connection without a reply.
        send(3, Request::Unknown { ordinal: 42 });
        assert!(recv_message(client.as_fd(), &mut buf, 0).is_err());

        let stats = stop(server);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.launches_failed, 1);
        assert_eq!(stats.launches_ok, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_connection_limit_rejects_extra_clients() {
        let path = temp_socket("limit");
        let config = LauncherConfig::new().socket_path(&path).max_connections(1).sq_entries(16);
        let Some(server) = serve(config) else { return };

        let first = connect(&path);
        let second = connect(&path);

        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        let err = recv_message(second.as_fd(), &mut buf, 0).unwrap_err();
        assert_eq!(err, ChannelError::PeerClosed);

        let stats = stop(server);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
        // The admitted client is closed at shutdown.
        assert_eq!(stats.closed, 1);
        assert_eq!(
            recv_message(first.as_fd(), &mut buf, 0).unwrap_err(),
            ChannelError::PeerClosed
        );
        assert!(!path.exists());
    }

    /// Replays a fixed list of wait outcomes, then fails every wait.
    struct ScriptedReactor {
        script: VecDeque<Vec<u64>>,
    }

    impl Reactor for ScriptedReactor {
        fn begin_wait(&mut self, _key: u64, _fd: RawFd, _signals: Signals) -> Result<(), WaitError> {
            Ok(())
        }

        fn wait(&mut self, out: &mut Vec<Readiness>) -> Result<(), WaitError> {
            let keys = self.script.pop_front().ok_or(WaitError::Submit(libc::EBADF))?;
            for key in keys {
                let packet = SignalPacket { observed: Signals::READABLE, count: 4 };
                out.push(Readiness { key, result: Ok(packet) });
            }
            Ok(())
        }
    }

    #[test]
    fn test_reactor_failure_still_shuts_down() {
        let path = temp_socket("reactor-fail");
        let config = LauncherConfig::new().socket_path(&path).max_connections(2);
        let reactor = ScriptedReactor { script: VecDeque::from([vec![LISTENER_KEY]]) };
        let mut service = Service::with_reactor(config, LinuxSpawner::new(), reactor).unwrap();

        let client = connect(&path);
        let err = service.run().unwrap_err();
        assert_eq!(err, ServiceError::Reactor(WaitError::Submit(libc::EBADF)));

        assert_eq!(service.stats.accepted, 1);
        assert_eq!(service.stats.closed, 1);
        assert_eq!(service.conns.active(), 0);
        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        assert_eq!(
            recv_message(client.as_fd(), &mut buf, 0).unwrap_err(),
            ChannelError::PeerClosed
        );
        assert!(!path.exists());
    }
}
