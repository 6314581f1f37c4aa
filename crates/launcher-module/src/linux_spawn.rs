//! `LinuxSpawner` / `LinuxContext`: default builder implementation.
//!
//! Maps the execution-context model onto plain Linux primitives:
//!
//! | Concept          | Linux form                                        |
//! |------------------|---------------------------------------------------|
//! | job              | cgroup v2 directory; child writes to cgroup.procs |
//! | image            | executable fd, started with `fexecve`             |
//! | interpreter      | fd from the loader service, started with `fexecve`|
//! | root mem region  | memfd holding the startup table, fd 3 in child    |
//! | startup handles  | fds 4.. in the child; `FD` handles at their arg   |
//! | process handle   | pidfd                                             |
//!
//! The startup table is text, one entry per line:
//!
//! ```text
//! handle <id as 8 hex digits> <fd>
//! name <slot> <path>
//! ```
//!
//! Everything the child needs is prepared before `fork`. Between `fork`
//! and exec the child makes only async-signal-safe calls and reports a
//! failing errno through a close-on-exec pipe.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{Seek, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use launcher_core::builder::{BuilderFactory, CStrArray, ContextBuilder};
use launcher_core::error::BuildError;
use launcher_core::handle::{handle_arg, handle_type, ty, Handle, StartupHandle, LOADER_SERVICE_ID};
use launcher_core::status::Status;
use launcher_core::{kdebug, ktrace};

use crate::elf::{self, ImageKind};
use crate::loader;
use crate::sys::{cvt, errno, retry_eintr, status_from_errno};

/// Where the startup region lands in the child.
pub const STARTUP_REGION_FD: RawFd = 3;
/// First fd handed out to startup handles without a fixed number.
pub const FIRST_HANDLE_FD: RawFd = 4;
/// Sources are lifted to at least this fd before `fork`.
const MIN_LIFT_FD: RawFd = 16;

fn err_errno(errno: i32, what: &str) -> BuildError {
    BuildError::new(
        status_from_errno(errno),
        format!("{}: {}", what, std::io::Error::from_raw_os_error(errno)),
    )
}

fn err_io(e: std::io::Error, what: &str) -> BuildError {
    err_errno(e.raw_os_error().unwrap_or(libc::EIO), what)
}

/// Creates `LinuxContext` builders.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxSpawner;

impl LinuxSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl BuilderFactory for LinuxSpawner {
    type Builder = LinuxContext;

    fn create(&self, job: Handle, name: &CStr) -> Result<LinuxContext, BuildError> {
        let cgroup_procs = open_job(job.as_fd())?;
        let region = create_region()?;
        Ok(LinuxContext {
            name: name.to_owned(),
            _job: job,
            cgroup_procs,
            loader: None,
            exec: None,
            args: Vec::new(),
            environ: Vec::new(),
            names: Vec::new(),
            handles: Vec::new(),
            region: Some(region),
        })
    }
}

/// A job must be a directory. If it is a cgroup (has `cgroup.procs`) the
/// child joins it; a plain directory means the child stays in the
/// launcher's own cgroup.
fn open_job(job: BorrowedFd<'_>) -> Result<Option<OwnedFd>, BuildError> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::fstat(job.as_raw_fd(), &mut st) }).map_err(|e| err_errno(e, "stat job"))?;
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return Err(BuildError::new(Status::WRONG_TYPE, "job handle is not a directory"));
    }

    let fd = unsafe {
        libc::openat(
            job.as_raw_fd(),
            c"cgroup.procs".as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        )
    };
    if fd >= 0 {
        return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
    }
    match errno() {
        libc::ENOENT => {
            kdebug!("job is not a cgroup; process stays in the launcher's cgroup");
            Ok(None)
        }
        e => Err(err_errno(e, "open job cgroup.procs")),
    }
}

fn create_region() -> Result<OwnedFd, BuildError> {
    let fd = unsafe { libc::memfd_create(c"startup-region".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(err_errno(errno(), "create startup region"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

enum Exec {
    /// Static image, executed directly.
    Direct { image: Handle },
    /// Dynamic image, run through the interpreter the loader supplied.
    Interpreted { image: Handle, interp: Handle, interp_path: CString },
}

pub struct LinuxContext {
    name: CString,
    _job: Handle,
    cgroup_procs: Option<OwnedFd>,
    loader: Option<Handle>,
    exec: Option<Exec>,
    args: Vec<CString>,
    environ: Vec<CString>,
    names: Vec<CString>,
    handles: Vec<StartupHandle>,
    region: Option<OwnedFd>,
}

impl ContextBuilder for LinuxContext {
    fn use_loader_service(&mut self, loader: Handle) -> Option<Handle> {
        self.loader.replace(loader)
    }

    fn load_from_image(&mut self, image: Handle) -> Result<(), BuildError> {
        if self.exec.is_some() {
            return Err(BuildError::new(Status::BAD_STATE, "image already loaded"));
        }
        let exec = match elf::probe(image.as_fd())? {
            ImageKind::Static => Exec::Direct { image },
            ImageKind::Dynamic { interp } => {
                let loader = self.loader.as_ref().ok_or_else(|| {
                    BuildError::new(Status::INVALID_ARGS, "no loader service to resolve PT_INTERP")
                })?;
                ktrace!("resolving interpreter {:?}", interp);
                let interp_fd = loader::load_object(loader.as_fd(), &interp)?;
                Exec::Interpreted { image, interp: interp_fd, interp_path: interp }
            }
        };
        self.exec = Some(exec);
        Ok(())
    }

    fn set_args(&mut self, args: &CStrArray) -> Result<(), BuildError> {
        self.args = args.to_vec();
        Ok(())
    }

    fn set_environ(&mut self, environ: &CStrArray) -> Result<(), BuildError> {
        self.environ = environ.to_vec();
        Ok(())
    }

    fn set_nametable(&mut self, names: &CStrArray) -> Result<(), BuildError> {
        if names.iter().any(|n| n.to_bytes().contains(&b'\n')) {
            return Err(BuildError::new(Status::INVALID_ARGS, "name table path contains a newline"));
        }
        self.names = names.to_vec();
        Ok(())
    }

    fn add_handles(&mut self, handles: Vec<StartupHandle>) -> Result<(), BuildError> {
        let reserved = handles.iter().any(|h| {
            handle_type(h.id) == ty::FD && handle_arg(h.id) as RawFd == STARTUP_REGION_FD
        });
        if reserved {
            return Err(BuildError::new(
                Status::INVALID_ARGS,
                format!("fd {} is reserved for the startup region", STARTUP_REGION_FD),
            ));
        }
        self.handles.extend(handles);
        Ok(())
    }

    fn root_vmar(&self) -> Result<BorrowedFd<'_>, BuildError> {
        self.region
            .as_ref()
            .map(|r| r.as_fd())
            .ok_or_else(|| BuildError::new(Status::BAD_STATE, "startup region already consumed"))
    }

    fn start(mut self) -> Result<Handle, BuildError> {
        // ── Step 1: take what commit consumes ──
        let exec = self
            .exec
            .take()
            .ok_or_else(|| BuildError::new(Status::BAD_STATE, "no image loaded"))?;
        let region = self
            .region
            .take()
            .ok_or_else(|| BuildError::new(Status::BAD_STATE, "startup region already consumed"))?;
        let mut handles = std::mem::take(&mut self.handles);
        if let Some(loader) = self.loader.take() {
            handles.push(StartupHandle::new(LOADER_SERVICE_ID, loader));
        }

        // ── Step 2: decide where every handle lands in the child ──
        let mut targets = TargetAllocator::new(&handles);
        let handle_fds: Vec<RawFd> = handles.iter().map(|h| targets.place(h.id)).collect();
        let (exec_src, image_slot) = match &exec {
            Exec::Direct { image } => (image, None),
            Exec::Interpreted { image, interp, .. } => (interp, Some((image, targets.next_free()))),
        };

        // ── Step 3: write the startup table ──
        let region = write_startup_table(region, &handles, &handle_fds, &self.names)?;

        // ── Step 4: lift sources above every target ──
        let floor = targets.highest().max(STARTUP_REGION_FD).saturating_add(1).max(MIN_LIFT_FD);
        let mut keep: Vec<OwnedFd> = Vec::new();
        let mut dups: Vec<(RawFd, RawFd)> = Vec::new();

        let lifted = lift(region.as_fd(), floor)?;
        dups.push((lifted.as_raw_fd(), STARTUP_REGION_FD));
        keep.push(lifted);
        for (h, &target) in handles.iter().zip(&handle_fds) {
            let lifted = lift(h.handle.as_fd(), floor)?;
            dups.push((lifted.as_raw_fd(), target));
            keep.push(lifted);
        }

        if let Some((image, target)) = image_slot {
            let lifted = lift(image.as_fd(), floor)?;
            dups.push((lifted.as_raw_fd(), target));
            keep.push(lifted);
        }
        let exec_fd = lift(exec_src.as_fd(), floor)?;
        let procs_fd = match &self.cgroup_procs {
            Some(fd) => Some(lift(fd.as_fd(), floor)?),
            None => None,
        };

        // ── Step 5: argv, with the interpreter in front for dynamic images ──
        let mut argv = if self.args.is_empty() { vec![self.name.clone()] } else { self.args.clone() };
        if let (Exec::Interpreted { interp_path, .. }, Some((_, target))) = (&exec, image_slot) {
            argv = interpreter_argv(interp_path, &argv, target)?;
        }
        // ── Step 6: exec status pipe ──
        let (status_r, pipe_w) = pipe_cloexec()?;
        let status_w = lift(pipe_w.as_fd(), floor)?;
        drop(pipe_w);

        // ── Step 7: fork ──
        let argv = CStrArray::null_terminated(argv);
        let envp = CStrArray::null_terminated(std::mem::take(&mut self.environ));
        let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe { libc::sigemptyset(&mut sigmask) };
        let mut sigdfl: libc::sigaction = unsafe { std::mem::zeroed() };
        sigdfl.sa_sigaction = libc::SIG_DFL;

        let spec = ChildSpec {
            exec_fd: exec_fd.as_raw_fd(),
            argv: &argv,
            envp: &envp,
            name: &self.name,
            dups: &dups,
            procs_fd: procs_fd.as_ref().map(|f| f.as_raw_fd()),
            status_fd: status_w.as_raw_fd(),
            sigmask: &sigmask,
            sigdfl: &sigdfl,
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe { exec_child(&spec) },
            Ok(ForkResult::Parent { child }) => {
                drop(status_w);
                drop(keep);
                finish_spawn(child, status_r, &self.name)
            }
            Err(e) => Err(err_errno(e as i32, "fork")),
        }
    }
}

/// Hands out child fd numbers: `FD` handles get their argument, everything
/// else the lowest free number from `FIRST_HANDLE_FD` up.
struct TargetAllocator {
    claimed: HashSet<RawFd>,
    next: RawFd,
    highest: RawFd,
}

impl TargetAllocator {
    fn new(handles: &[StartupHandle]) -> Self {
        let claimed: HashSet<RawFd> = handles
            .iter()
            .filter(|h| handle_type(h.id) == ty::FD)
            .map(|h| handle_arg(h.id) as RawFd)
            .collect();
        Self { claimed, next: FIRST_HANDLE_FD, highest: STARTUP_REGION_FD }
    }

    fn place(&mut self, id: u32) -> RawFd {
        let fd = if handle_type(id) == ty::FD { handle_arg(id) as RawFd } else { self.next_free() };
        self.highest = self.highest.max(fd);
        fd
    }

    fn next_free(&mut self) -> RawFd {
        while self.claimed.contains(&self.next) {
            self.next += 1;
        }
        let fd = self.next;
        self.next += 1;
        self.highest = self.highest.max(fd);
        fd
    }

    fn highest(&self) -> RawFd {
        self.highest
    }
}

fn startup_table(handles: &[StartupHandle], fds: &[RawFd], names: &[CString]) -> String {
    let mut table = String::new();
    for (h, fd) in handles.iter().zip(fds) {
        table.push_str(&format!("handle {:08x} {}\n", h.id, fd));
    }
    for (slot, path) in names.iter().enumerate() {
        table.push_str(&format!("name {} {}\n", slot, path.to_string_lossy()));
    }
    table
}

fn write_startup_table(
    region: OwnedFd,
    handles: &[StartupHandle],
    fds: &[RawFd],
    names: &[CString],
) -> Result<OwnedFd, BuildError> {
    let mut file = File::from(region);
    file.write_all(startup_table(handles, fds, names).as_bytes())
        .map_err(|e| err_io(e, "write startup table"))?;
    file.rewind().map_err(|e| err_io(e, "rewind startup table"))?;
    Ok(file.into())
}

fn interpreter_argv(
    interp_path: &CString,
    argv: &[CString],
    image_fd: RawFd,
) -> Result<Vec<CString>, BuildError> {
    let image_path = CString::new(format!("/proc/self/fd/{}", image_fd))
        .map_err(|_| BuildError::from_status(Status::INTERNAL))?;
    let mut out = Vec::with_capacity(argv.len() + 3);
    out.push(interp_path.clone());
    out.push(c"--argv0".to_owned());
    out.push(argv[0].clone());
    out.push(image_path);
    out.extend(argv[1..].iter().cloned());
    Ok(out)
}

/// Duplicate `fd` to the lowest free number `>= floor`, close-on-exec.
fn lift(fd: BorrowedFd<'_>, floor: RawFd) -> Result<OwnedFd, BuildError> {
    let new = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if new < 0 {
        return Err(err_errno(errno(), "duplicate handle"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), BuildError> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })
        .map_err(|e| err_errno(e, "create status pipe"))?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn pidfd_open(pid: Pid) -> Result<OwnedFd, i32> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if ret < 0 {
        return Err(errno());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

/// `None` if the child reached exec, else the errno it reported.
fn read_exec_status(status_r: &OwnedFd) -> Option<i32> {
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < buf.len() {
        let n = retry_eintr(|| unsafe {
            libc::read(
                status_r.as_raw_fd(),
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        });
        match n {
            Ok(0) => break,
            Ok(n) => got += n as usize,
            Err(e) => return Some(e),
        }
    }
    match got {
        0 => None,
        4 => Some(i32::from_ne_bytes(buf)),
        _ => Some(libc::EIO),
    }
}

fn finish_spawn(child: Pid, status_r: OwnedFd, name: &CStr) -> Result<Handle, BuildError> {
    let pidfd = pidfd_open(child);
    if let Some(e) = read_exec_status(&status_r) {
        let _ = waitpid(child, None);
        return Err(err_errno(e, "exec"));
    }
    match pidfd {
        Ok(pidfd) => {
            kdebug!("started {:?} as pid {}", name, child);
            Ok(pidfd)
        }
        Err(e) => {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            Err(err_errno(e, "pidfd_open"))
        }
    }
}

/// Everything the child touches between `fork` and exec, prepared by the
/// parent so the child never allocates.
struct ChildSpec<'a> {
    exec_fd: RawFd,
    argv: &'a CStrArray,
    envp: &'a CStrArray,
    name: &'a CStr,
    dups: &'a [(RawFd, RawFd)],
    procs_fd: Option<RawFd>,
    status_fd: RawFd,
    sigmask: &'a libc::sigset_t,
    sigdfl: &'a libc::sigaction,
}

/// # Safety
/// Must only run in the child right after `fork`.
unsafe fn exec_child(spec: &ChildSpec<'_>) -> ! {
    libc::sigprocmask(libc::SIG_SETMASK, spec.sigmask, std::ptr::null_mut());
    libc::sigaction(libc::SIGPIPE, spec.sigdfl, std::ptr::null_mut());

    if let Some(fd) = spec.procs_fd {
        if libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) != 1 {
            child_fail(spec.status_fd);
        }
    }
    libc::prctl(libc::PR_SET_NAME, spec.name.as_ptr() as libc::c_ulong, 0, 0, 0);

    for &(src, dst) in spec.dups {
        if libc::dup2(src, dst) < 0 {
            child_fail(spec.status_fd);
        }
    }

    libc::fexecve(spec.exec_fd, spec.argv.as_ptr(), spec.envp.as_ptr());
    child_fail(spec.status_fd)
}

unsafe fn child_fail(status_fd: RawFd) -> ! {
    let e = *libc::__errno_location();
    let bytes = e.to_ne_bytes();
    libc::write(status_fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(127)
}
