//! `Launcher`: per-connection protocol dispatcher.
//!
//! One `Launcher` owns one client channel. It runs on the service's reactor
//! thread and is driven by readiness callbacks:
//!
//! ```text
//! start()    → register READABLE | PEER_CLOSED
//! on_ready() → read, decode, dispatch, up to `count` messages
//!              queue empty and peer gone? → teardown(PeerClosed)
//!              otherwise                  → register again
//! ```
//!
//! The four Add* operations only accumulate and never answer. `Launch`
//! consumes everything accumulated, builds and starts the process, clears
//! the state and writes exactly one response. Any transport or protocol
//! failure tears the connection down and calls the error handler once.

use std::rc::Rc;

use launcher_core::builder::{BuilderFactory, CStrArray};
use launcher_core::channel::Channel;
use launcher_core::codec::Codec;
use launcher_core::error::{LauncherError, WaitError};
use launcher_core::message::{ordinal, Header, LaunchInfo, LaunchResult, Request};
use launcher_core::reactor::{Reactor, SignalPacket, Signals};
use launcher_core::status::Status;
use launcher_core::{kdebug, kerror, ktrace, kwarn};

use crate::accumulator::{Accumulated, AccumulationState};
use crate::launchpad::Launchpad;

/// Called once when the connection is torn down.
pub type ErrorHandler = Box<dyn FnOnce(LauncherError)>;

/// Launch outcomes on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchStats {
    pub ok: u64,
    pub failed: u64,
}

pub struct Launcher<C, K, F>
where
    C: Channel,
    K: Codec,
    F: BuilderFactory,
{
    key: u64,
    channel: Option<C>,
    codec: K,
    factory: Rc<F>,
    state: AccumulationState,
    error_handler: Option<ErrorHandler>,
    stats: LaunchStats,
}

impl<C, K, F> Launcher<C, K, F>
where
    C: Channel,
    K: Codec,
    F: BuilderFactory,
{
    /// `key` identifies this connection's waits on the reactor.
    pub fn new(key: u64, channel: C, codec: K, factory: Rc<F>) -> Self {
        Self {
            key,
            channel: Some(channel),
            codec,
            factory,
            state: AccumulationState::new(),
            error_handler: None,
            stats: LaunchStats::default(),
        }
    }

    pub fn set_error_handler(&mut self, handler: impl FnOnce(LauncherError) + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    pub fn state(&self) -> &AccumulationState {
        &self.state
    }

    pub fn stats(&self) -> LaunchStats {
        self.stats
    }

    /// Begin waiting for messages. A registration failure tears the
    /// connection down.
    pub fn start<R: Reactor>(&mut self, reactor: &mut R) {
        if let Err(e) = self.wait_on(reactor) {
            self.notify_error(e);
        }
    }

    /// Tear down from outside, e.g. when the service stops.
    pub fn close(&mut self) {
        if !self.is_closed() {
            self.notify_error(LauncherError::Shutdown);
        }
    }

    fn wait_on<R: Reactor>(&self, reactor: &mut R) -> Result<(), LauncherError> {
        let channel = self.channel.as_ref().ok_or(LauncherError::BadState)?;
        reactor.begin_wait(self.key, channel.raw_fd(), Signals::READABLE | Signals::PEER_CLOSED)?;
        Ok(())
    }

    /// Readiness callback for this connection's key.
    pub fn on_ready<R: Reactor>(&mut self, reactor: &mut R, result: Result<SignalPacket, WaitError>) {
        if self.is_closed() {
            // Completion for a wait registered before teardown.
            return;
        }
        let packet = match result {
            Ok(packet) => packet,
            Err(e) => return self.notify_error(e.into()),
        };

        let peer_closed = packet.observed.contains(Signals::PEER_CLOSED);
        if packet.observed.contains(Signals::READABLE) || peer_closed {
            let mut drained = false;
            for _ in 0..packet.count.max(1) {
                match self.read_and_dispatch() {
                    Ok(true) => {}
                    Ok(false) => {
                        drained = true;
                        break;
                    }
                    Err(e) => return self.notify_error(e),
                }
            }
            // Queued messages are answered before a closed peer is dropped.
            if peer_closed && drained {
                return self.notify_error(LauncherError::PeerClosed);
            }
        }

        if let Err(e) = self.wait_on(reactor) {
            self.notify_error(e);
        }
    }

    /// Read and handle one message. `Ok(false)` when nothing is queued.
    fn read_and_dispatch(&mut self) -> Result<bool, LauncherError> {
        let channel = self.channel.as_mut().ok_or(LauncherError::BadState)?;
        let Some(msg) = channel.read()? else {
            return Ok(false);
        };

        let header = self
            .codec
            .decode_header(&msg.bytes)
            .map_err(|err| LauncherError::Decode { op: "header", err })?;
        let op = ordinal::name(header.ordinal);
        let request = self
            .codec
            .decode_request(&header, msg)
            .map_err(|err| LauncherError::Decode { op, err })?;
        ktrace!("conn {:#x}: {} txid={}", self.key, request.name(), header.txid);

        self.dispatch(&header, request)?;
        Ok(true)
    }

    fn dispatch(&mut self, header: &Header, request: Request) -> Result<(), LauncherError> {
        match request {
            Request::Launch(info) => self.launch(header, info),
            Request::AddArgs(args) => {
                self.state.add_args(args);
                Ok(())
            }
            Request::AddEnvirons(environs) => {
                self.state.add_environs(environs);
                Ok(())
            }
            Request::AddNames(names) => {
                self.state.add_names(names);
                Ok(())
            }
            Request::AddHandles(handles) => {
                self.state.add_handles(handles);
                Ok(())
            }
            Request::Unknown { ordinal } => Err(LauncherError::UnknownOrdinal(ordinal)),
        }
    }

    fn launch(&mut self, header: &Header, info: LaunchInfo) -> Result<(), LauncherError> {
        let LaunchInfo { executable, job, name } = info;

        // ── Step 1: take everything accumulated ──
        let Accumulated { args, environs, names, handles, loader } = self.state.take();

        // ── Step 2: flat arrays ──
        let argv = CStrArray::new(args);
        let envp = CStrArray::null_terminated(environs);
        let nametable = CStrArray::new(names);

        // ── Step 3: builder scoped to the job ──
        let mut lp = Launchpad::create(&*self.factory, job, &name);

        // ── Step 4: loader service ──
        match loader {
            Some(loader) => drop(lp.use_loader_service(loader)),
            None => lp.abort(Status::INVALID_ARGS, "need loader service to load PT_INTERP"),
        }

        // ── Step 5: configure ──
        lp.load_from_image(executable);
        lp.set_args(&argv);
        lp.set_environ(&envp);
        lp.set_nametable(&nametable);
        lp.add_handles(handles);

        // ── Step 6: keep the root region past commit ──
        lp.duplicate_root_vmar();

        // ── Step 7: commit ──
        let result = match lp.go() {
            Ok((process, root_vmar)) => {
                self.stats.ok += 1;
                kdebug!("conn {:#x}: launched {}", self.key, name.to_string_lossy());
                LaunchResult::started(process, root_vmar)
            }
            Err(e) => {
                self.stats.failed += 1;
                kwarn!("conn {:#x}: launch of {} failed: {}", self.key, name.to_string_lossy(), e);
                LaunchResult::failed(e.status, e.message)
            }
        };

        // ── Step 8: clear state, respond ──
        self.state.reset();
        let response = self.codec.encode_launch_response(header, result)?;
        let channel = self.channel.as_mut().ok_or(LauncherError::BadState)?;
        channel.write(response)?;
        Ok(())
    }

    fn notify_error(&mut self, err: LauncherError) {
        match err {
            LauncherError::PeerClosed | LauncherError::Shutdown => {
                kdebug!("conn {:#x}: {}", self.key, err)
            }
            _ => kerror!("conn {:#x}: {}", self.key, err),
        }
        self.state.reset();
        self.channel = None;
        if let Some(handler) = self.error_handler.take() {
            handler(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::ffi::{CStr, CString};
    use std::fs::File;
    use std::io::{Read, Seek, Write};
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

    use launcher_core::builder::ContextBuilder;
    use launcher_core::error::{BuildError, ChannelError, DecodeError};
    use launcher_core::handle::{handle_id, ty, Handle, StartupHandle, LOADER_SERVICE_ID};
    use launcher_core::message::{HandleInfo, NameInfo, RawMessage};
    use launcher_module::wire_codec::WireCodec;

    // ── Channel double ──

    #[derive(Default)]
    struct Wire {
        inbound: VecDeque<RawMessage>,
        peer_closed: bool,
        written: Vec<RawMessage>,
        fail_write: bool,
    }

    struct MockChannel {
        wire: Rc<RefCell<Wire>>,
        fd: OwnedFd,
    }

    impl Channel for MockChannel {
        fn read(&mut self) -> Result<Option<RawMessage>, ChannelError> {
            let mut wire = self.wire.borrow_mut();
            match wire.inbound.pop_front() {
                Some(msg) => Ok(Some(msg)),
                None if wire.peer_closed => Err(ChannelError::PeerClosed),
                None => Ok(None),
            }
        }

        fn write(&mut self, msg: RawMessage) -> Result<(), ChannelError> {
            let mut wire = self.wire.borrow_mut();
            if wire.fail_write {
                return Err(ChannelError::Os(libc::EAGAIN));
            }
            wire.written.push(msg);
            Ok(())
        }

        fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    // ── Reactor double ──

    #[derive(Default)]
    struct MockReactor {
        waits: Vec<(u64, Signals)>,
        fail: bool,
    }

    impl Reactor for MockReactor {
        fn begin_wait(&mut self, key: u64, _fd: RawFd, signals: Signals) -> Result<(), WaitError> {
            if self.fail {
                return Err(WaitError::QueueFull);
            }
            self.waits.push((key, signals));
            Ok(())
        }

        fn wait(&mut self, _out: &mut Vec<launcher_core::reactor::Readiness>) -> Result<(), WaitError> {
            Ok(())
        }
    }

    // ── Recording builder ──

    #[derive(Default)]
    struct Record {
        created: Vec<CString>,
        loaders: usize,
        images: usize,
        args: Vec<CString>,
        environ: Vec<CString>,
        environ_terminated: bool,
        names: Vec<CString>,
        handle_ids: Vec<u32>,
        started: usize,
    }

    #[derive(Default)]
    struct RecordingFactory {
        log: Rc<RefCell<Record>>,
        fail_load: Option<Status>,
        fail_start: Option<Status>,
    }

    struct RecordingBuilder {
        log: Rc<RefCell<Record>>,
        fail_load: Option<Status>,
        fail_start: Option<Status>,
        region: OwnedFd,
    }

    impl BuilderFactory for RecordingFactory {
        type Builder = RecordingBuilder;

        fn create(&self, _job: Handle, name: &CStr) -> Result<RecordingBuilder, BuildError> {
            self.log.borrow_mut().created.push(name.to_owned());
            Ok(RecordingBuilder {
                log: self.log.clone(),
                fail_load: self.fail_load,
                fail_start: self.fail_start,
                region: tagged("root-region"),
            })
        }
    }

    impl ContextBuilder for RecordingBuilder {
        fn use_loader_service(&mut self, _loader: Handle) -> Option<Handle> {
            self.log.borrow_mut().loaders += 1;
            None
        }

        fn load_from_image(&mut self, _image: Handle) -> Result<(), BuildError> {
            if let Some(status) = self.fail_load {
                return Err(BuildError::new(status, "cannot load image"));
            }
            self.log.borrow_mut().images += 1;
            Ok(())
        }

        fn set_args(&mut self, args: &CStrArray) -> Result<(), BuildError> {
            self.log.borrow_mut().args = args.to_vec();
            Ok(())
        }

        fn set_environ(&mut self, environ: &CStrArray) -> Result<(), BuildError> {
            let mut log = self.log.borrow_mut();
            log.environ = environ.to_vec();
            log.environ_terminated = environ.is_null_terminated();
            Ok(())
        }

        fn set_nametable(&mut self, names: &CStrArray) -> Result<(), BuildError> {
            self.log.borrow_mut().names = names.to_vec();
            Ok(())
        }

        fn add_handles(&mut self, handles: Vec<StartupHandle>) -> Result<(), BuildError> {
            self.log.borrow_mut().handle_ids.extend(handles.iter().map(|h| h.id));
            Ok(())
        }

        fn root_vmar(&self) -> Result<BorrowedFd<'_>, BuildError> {
            Ok(self.region.as_fd())
        }

        fn start(self) -> Result<Handle, BuildError> {
            if let Some(status) = self.fail_start {
                return Err(BuildError::from_status(status));
            }
            self.log.borrow_mut().started += 1;
            // The builder's own region closes here.
            Ok(tagged("process"))
        }
    }

    // ── Fixtures ──

    type TestLauncher = Launcher<MockChannel, WireCodec, RecordingFactory>;

    struct Fixture {
        launcher: TestLauncher,
        wire: Rc<RefCell<Wire>>,
        log: Rc<RefCell<Record>>,
        errors: Rc<RefCell<Vec<LauncherError>>>,
        reactor: MockReactor,
    }

    fn fixture(factory: RecordingFactory) -> Fixture {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let log = factory.log.clone();
        let channel = MockChannel { wire: wire.clone(), fd: null() };
        let mut launcher = Launcher::new(0x42, channel, WireCodec::new(), Rc::new(factory));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        launcher.set_error_handler(move |e| sink.borrow_mut().push(e));

        let mut reactor = MockReactor::default();
        launcher.start(&mut reactor);
        Fixture { launcher, wire, log, errors, reactor }
    }

    impl Fixture {
        fn send(&self, txid: u32, request: Request) {
            let msg = WireCodec::new().encode_request(txid, request).unwrap();
            self.wire.borrow_mut().inbound.push_back(msg);
        }

        fn ready(&mut self, observed: Signals, count: usize) {
            let packet = SignalPacket { observed, count };
            self.launcher.on_ready(&mut self.reactor, Ok(packet));
        }

        fn responses(&self) -> Vec<(Header, LaunchResult)> {
            let written = std::mem::take(&mut self.wire.borrow_mut().written);
            written
                .into_iter()
                .map(|m| WireCodec::new().decode_launch_response(m).unwrap())
                .collect()
        }
    }

    fn null() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    fn tagged(tag: &str) -> OwnedFd {
        let fd = unsafe { libc::memfd_create(c"launcher-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let mut f = unsafe { File::from_raw_fd(fd) };
        f.write_all(tag.as_bytes()).unwrap();
        f.into()
    }

    fn read_tag(h: Handle) -> String {
        let mut f = File::from(h);
        f.rewind().unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        s
    }

    fn cstrings(v: &[&str]) -> Vec<CString> {
        v.iter().map(|s| CString::new(*s).unwrap()).collect()
    }

    fn loader() -> Request {
        Request::AddHandles(vec![HandleInfo { handle: null(), id: LOADER_SERVICE_ID }])
    }

    fn launch(name: &str) -> Request {
        Request::Launch(LaunchInfo {
            executable: null(),
            job: null(),
            name: CString::new(name).unwrap(),
        })
    }

    const READABLE: Signals = Signals::READABLE;

    // ── Accumulation ──

    #[test]
    fn test_start_registers_both_signals() {
        let f = fixture(RecordingFactory::default());
        assert_eq!(f.reactor.waits, vec![(0x42, Signals::READABLE | Signals::PEER_CLOSED)]);
    }

    #[test]
    fn test_args_and_environ_arrive_in_call_order() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["/bin/sh", "-c"])));
        f.send(2, Request::AddEnvirons(cstrings(&["A=1"])));
        f.send(3, loader());
        f.send(4, Request::AddArgs(cstrings(&["echo hi"])));
        f.send(5, Request::AddEnvirons(cstrings(&["B=2"])));
        f.send(6, launch("sh"));
        f.ready(READABLE, 64);

        let log = f.log.borrow();
        assert_eq!(log.created, cstrings(&["sh"]));
        assert_eq!(log.args, cstrings(&["/bin/sh", "-c", "echo hi"]));
        assert_eq!(log.environ, cstrings(&["A=1", "B=2"]));
        assert!(log.environ_terminated);
        assert_eq!(log.started, 1);
        drop(log);

        let responses = f.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0.txid, 6);
        assert_eq!(responses[0].1.status, Status::OK);
        assert!(f.launcher.state().is_empty());
    }

    #[test]
    fn test_add_calls_never_answer() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["a"])));
        f.send(2, Request::AddEnvirons(cstrings(&["B=1"])));
        f.send(3, Request::AddNames(vec![NameInfo { path: CString::new("/svc").unwrap(), directory: null() }]));
        f.send(4, loader());
        f.ready(READABLE, 64);
        assert!(f.wire.borrow().written.is_empty());
        assert_eq!(f.launcher.state().args().len(), 1);
        assert!(f.launcher.state().loader().is_some());
        assert!(!f.launcher.is_closed());
    }

    #[test]
    fn test_names_and_handles_reach_builder() {
        let mut f = fixture(RecordingFactory::default());
        let user = handle_id(ty::USER0, 3);
        f.send(1, Request::AddNames(vec![
            NameInfo { path: CString::new("/svc").unwrap(), directory: null() },
            NameInfo { path: CString::new("/data").unwrap(), directory: null() },
        ]));
        f.send(2, Request::AddHandles(vec![
            HandleInfo { handle: null(), id: LOADER_SERVICE_ID },
            HandleInfo { handle: null(), id: user },
            HandleInfo { handle: null(), id: LOADER_SERVICE_ID },
        ]));
        f.send(3, Request::AddNames(vec![NameInfo { path: CString::new("/tmp").unwrap(), directory: null() }]));
        f.send(4, launch("app"));
        f.ready(READABLE, 64);

        let log = f.log.borrow();
        assert_eq!(log.names, cstrings(&["/svc", "/data", "/tmp"]));
        assert_eq!(
            log.handle_ids,
            vec![handle_id(ty::NS_DIR, 0), handle_id(ty::NS_DIR, 1), user, handle_id(ty::NS_DIR, 2)]
        );
        assert!(!log.handle_ids.contains(&LOADER_SERVICE_ID));
        assert_eq!(log.loaders, 1);
    }

    // ── Launch ──

    #[test]
    fn test_launch_without_loader_is_invalid_args() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["/bin/true"])));
        f.send(2, launch("true"));
        f.ready(READABLE, 64);

        let (_, result) = f.responses().pop().unwrap();
        assert_eq!(result.status, Status::INVALID_ARGS);
        assert!(result.error_message.unwrap().contains("need loader service"));
        assert!(result.process.is_none());
        assert!(result.root_vmar.is_none());
        assert_eq!(f.log.borrow().started, 0);
        assert_eq!(f.launcher.stats(), LaunchStats { ok: 0, failed: 1 });
        assert!(!f.launcher.is_closed());
    }

    #[test]
    fn test_failed_launch_leaves_empty_state() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["stale"])));
        f.send(2, Request::AddEnvirons(cstrings(&["STALE=1"])));
        f.send(3, launch("first"));
        f.send(4, Request::AddArgs(cstrings(&["fresh"])));
        f.send(5, loader());
        f.send(6, launch("second"));
        f.ready(READABLE, 64);

        let responses = f.responses();
        assert_eq!(responses[0].1.status, Status::INVALID_ARGS);
        assert_eq!(responses[1].1.status, Status::OK);
        let log = f.log.borrow();
        assert_eq!(log.args, cstrings(&["fresh"]));
        assert!(log.environ.is_empty());
    }

    #[test]
    fn test_successful_launch_leaves_empty_state() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["one"])));
        f.send(2, loader());
        f.send(3, launch("a"));
        f.send(4, launch("b"));
        f.ready(READABLE, 64);

        let responses = f.responses();
        assert_eq!(responses[0].1.status, Status::OK);
        // The loader went with the first launch.
        assert_eq!(responses[1].1.status, Status::INVALID_ARGS);
        assert_eq!(f.log.borrow().created.len(), 2);
        assert_eq!(f.log.borrow().started, 1);
        assert!(f.launcher.state().is_empty());
    }

    #[test]
    fn test_root_vmar_survives_commit() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, loader());
        f.send(2, launch("vmar"));
        f.ready(READABLE, 64);

        let (_, result) = f.responses().pop().unwrap();
        assert_eq!(result.status, Status::OK);
        assert!(result.error_message.is_none());
        assert_eq!(read_tag(result.process.unwrap()), "process");
        assert_eq!(read_tag(result.root_vmar.unwrap()), "root-region");
    }

    #[test]
    fn test_builder_failure_is_reported_not_fatal() {
        let factory = RecordingFactory { fail_load: Some(Status::NOT_SUPPORTED), ..Default::default() };
        let mut f = fixture(factory);
        f.send(1, loader());
        f.send(2, launch("script"));
        f.ready(READABLE, 64);

        let (_, result) = f.responses().pop().unwrap();
        assert_eq!(result.status, Status::NOT_SUPPORTED);
        assert_eq!(result.error_message.as_deref(), Some("cannot load image"));
        assert_eq!(f.log.borrow().started, 0);
        assert!(f.errors.borrow().is_empty());
        assert_eq!(f.reactor.waits.len(), 2);
    }

    #[test]
    fn test_commit_failure_without_message() {
        let factory = RecordingFactory { fail_start: Some(Status::ACCESS_DENIED), ..Default::default() };
        let mut f = fixture(factory);
        f.send(1, loader());
        f.send(2, launch("denied"));
        f.ready(READABLE, 64);

        let (_, result) = f.responses().pop().unwrap();
        assert_eq!(result.status, Status::ACCESS_DENIED);
        assert!(result.error_message.is_none());
        assert!(result.root_vmar.is_none());
    }

    #[test]
    fn test_pipelined_launches_answer_in_order() {
        let mut f = fixture(RecordingFactory::default());
        f.send(10, loader());
        f.send(11, launch("a"));
        f.send(12, loader());
        f.send(13, launch("b"));
        f.ready(READABLE, 64);
        let txids: Vec<u32> = f.responses().iter().map(|(h, _)| h.txid).collect();
        assert_eq!(txids, vec![11, 13]);
        assert_eq!(f.launcher.stats(), LaunchStats { ok: 2, failed: 0 });
    }

    #[test]
    fn test_response_write_failure_is_fatal() {
        let mut f = fixture(RecordingFactory::default());
        f.wire.borrow_mut().fail_write = true;
        f.send(1, loader());
        f.send(2, launch("x"));
        f.ready(READABLE, 64);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::Channel(ChannelError::Os(libc::EAGAIN))]);
        assert!(f.launcher.is_closed());
        // The process had already started; it is not rolled back.
        assert_eq!(f.log.borrow().started, 1);
    }

    // ── Readiness and teardown ──

    #[test]
    fn test_drain_respects_count_and_rearms() {
        let mut f = fixture(RecordingFactory::default());
        for i in 0..3 {
            f.send(i, Request::AddArgs(cstrings(&["x"])));
        }
        f.ready(READABLE, 2);
        assert_eq!(f.wire.borrow().inbound.len(), 1);
        assert_eq!(f.reactor.waits.len(), 2);

        f.ready(READABLE, 2);
        assert!(f.wire.borrow().inbound.is_empty());
        assert_eq!(f.launcher.state().args().len(), 3);
        assert_eq!(f.reactor.waits.len(), 3);
    }

    #[test]
    fn test_peer_close_after_pending_launch_still_answers() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, loader());
        f.send(2, launch("last"));
        f.wire.borrow_mut().peer_closed = true;
        f.ready(Signals::READABLE | Signals::PEER_CLOSED, 64);

        let responses = f.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, Status::OK);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::PeerClosed]);
        assert!(f.launcher.is_closed());
    }

    #[test]
    fn test_peer_close_with_nothing_pending() {
        let mut f = fixture(RecordingFactory::default());
        f.wire.borrow_mut().peer_closed = true;
        f.ready(Signals::PEER_CLOSED, 64);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::PeerClosed]);
        assert!(f.wire.borrow().written.is_empty());
        assert_eq!(f.reactor.waits.len(), 1);
    }

    #[test]
    fn test_peer_close_signal_with_more_than_count_rearms() {
        let mut f = fixture(RecordingFactory::default());
        for i in 0..3 {
            f.send(i, Request::AddArgs(cstrings(&["x"])));
        }
        f.wire.borrow_mut().peer_closed = true;
        f.ready(Signals::PEER_CLOSED, 2);
        assert!(f.errors.borrow().is_empty());
        assert_eq!(f.reactor.waits.len(), 2);

        f.ready(Signals::PEER_CLOSED, 2);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::PeerClosed]);
    }

    #[test]
    fn test_truncated_launch_tears_down_silently() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, loader());
        let mut bad = WireCodec::new().encode_request(2, launch("cut")).unwrap();
        bad.bytes.truncate(bad.bytes.len() - 2);
        f.wire.borrow_mut().inbound.push_back(bad);
        f.send(3, launch("after"));
        f.ready(READABLE, 64);

        assert!(f.wire.borrow().written.is_empty());
        assert_eq!(f.wire.borrow().inbound.len(), 1);
        let errors = f.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LauncherError::Decode { op: "Launch", err: DecodeError::Truncated { .. } }));
        assert_eq!(errors[0].status(), Status::INVALID_ARGS);
        assert!(f.launcher.state().is_empty());
        assert_eq!(f.log.borrow().created.len(), 0);
    }

    #[test]
    fn test_short_header_is_fatal() {
        let mut f = fixture(RecordingFactory::default());
        f.wire.borrow_mut().inbound.push_back(RawMessage::new(vec![1, 2, 3], Vec::new()));
        f.ready(READABLE, 64);
        let errors = f.errors.borrow();
        assert!(matches!(errors[0], LauncherError::Decode { op: "header", .. }));
    }

    #[test]
    fn test_unknown_ordinal_is_not_supported() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::Unknown { ordinal: 99 });
        f.ready(READABLE, 64);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::UnknownOrdinal(99)]);
        assert_eq!(f.errors.borrow()[0].status(), Status::NOT_SUPPORTED);
        assert!(f.launcher.is_closed());
    }

    #[test]
    fn test_error_handler_runs_once() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::Unknown { ordinal: 7 });
        f.ready(READABLE, 64);
        f.ready(READABLE, 64);
        f.launcher.on_ready(&mut f.reactor, Err(WaitError::Os(libc::EBADF)));
        f.launcher.close();
        assert_eq!(f.errors.borrow().len(), 1);
    }

    #[test]
    fn test_start_failure_tears_down() {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let channel = MockChannel { wire, fd: null() };
        let mut launcher: TestLauncher =
            Launcher::new(1, channel, WireCodec::new(), Rc::new(RecordingFactory::default()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        launcher.set_error_handler(move |e| sink.borrow_mut().push(e));

        let mut reactor = MockReactor { fail: true, ..Default::default() };
        launcher.start(&mut reactor);
        assert_eq!(*errors.borrow(), vec![LauncherError::Wait(WaitError::QueueFull)]);
        assert!(launcher.is_closed());
    }

    #[test]
    fn test_rearm_failure_tears_down() {
        let mut f = fixture(RecordingFactory::default());
        f.reactor.fail = true;
        f.send(1, Request::AddArgs(cstrings(&["x"])));
        f.ready(READABLE, 64);
        assert_eq!(*f.errors.borrow(), vec![LauncherError::Wait(WaitError::QueueFull)]);
    }

    #[test]
    fn test_wait_error_tears_down() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["x"])));
        f.ready(READABLE, 1);
        f.launcher.on_ready(&mut f.reactor, Err(WaitError::Os(libc::EBADF)));
        assert_eq!(*f.errors.borrow(), vec![LauncherError::Wait(WaitError::Os(libc::EBADF))]);
        assert!(f.launcher.state().is_empty());
    }

    #[test]
    fn test_close_reports_shutdown() {
        let mut f = fixture(RecordingFactory::default());
        f.send(1, Request::AddArgs(cstrings(&["x"])));
        f.ready(READABLE, 64);
        f.launcher.close();
        assert_eq!(*f.errors.borrow(), vec![LauncherError::Shutdown]);
        assert!(f.launcher.state().is_empty());
    }

    // ── End to end with the Linux builder ──

    #[test]
    fn test_shell_scenario_with_linux_spawner() {
        use launcher_module::linux_spawn::LinuxSpawner;
        use launcher_module::loader;
        use launcher_module::seqpacket_channel::SeqpacketChannel;

        let (loader_client, loader_server) = SeqpacketChannel::pair().unwrap();
        let loader_server = loader_server.into_inner();
        std::thread::spawn(move || {
            while loader::serve_one(loader_server.as_fd(), |name| {
                let path = name.to_str().map_err(|_| Status::INVALID_ARGS)?;
                File::open(path).map(Into::into).map_err(|_| Status::NOT_FOUND)
            })
            .is_ok()
            {}
        });

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        let (mut out_r, out_w) = unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let wire = Rc::new(RefCell::new(Wire::default()));
        let channel = MockChannel { wire: wire.clone(), fd: null() };
        let mut launcher = Launcher::new(9, channel, WireCodec::new(), Rc::new(LinuxSpawner::new()));
        let mut reactor = MockReactor::default();
        launcher.start(&mut reactor);

        let codec = WireCodec::new();
        let mut push = |txid, req| {
            let msg = codec.encode_request(txid, req).unwrap();
            wire.borrow_mut().inbound.push_back(msg);
        };
        push(1, Request::AddArgs(cstrings(&["/bin/sh", "-c", "echo hi"])));
        push(2, Request::AddEnvirons(cstrings(&["HOME=/"])));
        push(3, Request::AddHandles(vec![
            HandleInfo { handle: loader_client.into_inner(), id: LOADER_SERVICE_ID },
            HandleInfo { handle: out_w, id: handle_id(ty::FD, 1) },
        ]));
        push(4, Request::Launch(LaunchInfo {
            executable: File::open("/bin/sh").unwrap().into(),
            job: File::open(std::env::temp_dir()).unwrap().into(),
            name: CString::new("sh").unwrap(),
        }));
        launcher.on_ready(&mut reactor, Ok(SignalPacket { observed: Signals::READABLE, count: 64 }));

        let msg = wire.borrow_mut().written.pop().unwrap();
        let (header, result) = codec.decode_launch_response(msg).unwrap();
        assert_eq!(header.txid, 4);
        assert_eq!(result.status, Status::OK, "{:?}", result.error_message);
        assert!(result.process.is_some());
        assert!(result.root_vmar.is_some());
        assert!(result.error_message.is_none());

        let mut out = String::new();
        out_r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
    }
}
