//! Execution-context builder abstraction.
//!
//! A `BuilderFactory` creates one `ContextBuilder` per Launch. The builder
//! is configured step by step and consumed by `start()`, which commits the
//! new process and hands back its handle.
//!
//! # Implementors
//!
//! - `LinuxSpawner` / `LinuxContext` (default): fork + `fexecve`, job as a
//!   cgroup directory, startup table in a memfd region.
//!
//! The loader service is explicit builder state: `use_loader_service()`
//! installs it for this builder only and returns whatever it displaced,
//! and `load_from_image()` is the one step that may block on it.

use std::ffi::{CStr, CString};
use std::os::fd::BorrowedFd;
use std::os::raw::c_char;

use crate::error::BuildError;
use crate::handle::{Handle, StartupHandle};

/// Flat `char*` array over owned strings, as process-creation APIs take.
///
/// The pointers reference the strings' heap buffers, which do not move
/// when the array itself is moved.
pub struct CStrArray {
    strings: Vec<CString>,
    ptrs: Vec<*const c_char>,
    terminated: bool,
}

impl CStrArray {
    pub fn new(strings: Vec<CString>) -> Self {
        Self::build(strings, false)
    }

    /// Same, with a trailing null pointer after the last string.
    pub fn null_terminated(strings: Vec<CString>) -> Self {
        Self::build(strings, true)
    }

    fn build(strings: Vec<CString>, terminated: bool) -> Self {
        let mut ptrs: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        if terminated {
            ptrs.push(std::ptr::null());
        }
        Self { strings, ptrs, terminated }
    }

    /// Number of strings; the terminator is not counted.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn is_null_terminated(&self) -> bool {
        self.terminated
    }

    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.strings.iter().map(CString::as_c_str)
    }

    pub fn to_vec(&self) -> Vec<CString> {
        self.strings.clone()
    }
}

/// Configures and commits one execution context.
///
/// Steps may be called in any order before `start()`. Dropping a builder
/// without starting it releases every handle it was given.
pub trait ContextBuilder {
    /// Install `loader` as this builder's resolver, returning the one it
    /// displaces.
    fn use_loader_service(&mut self, loader: Handle) -> Option<Handle>;

    /// Load the executable image. May perform a synchronous round trip on
    /// the installed loader to resolve the dynamic interpreter.
    fn load_from_image(&mut self, image: Handle) -> Result<(), BuildError>;

    fn set_args(&mut self, args: &CStrArray) -> Result<(), BuildError>;

    /// `environ` is null-terminated.
    fn set_environ(&mut self, environ: &CStrArray) -> Result<(), BuildError>;

    /// Paths of the name table; entry `i` belongs to the directory handle
    /// with id `handle_id(NS_DIR, i)`.
    fn set_nametable(&mut self, names: &CStrArray) -> Result<(), BuildError>;

    fn add_handles(&mut self, handles: Vec<StartupHandle>) -> Result<(), BuildError>;

    /// The context's root memory region. `start()` consumes it, so a caller
    /// that needs it afterwards duplicates it first.
    fn root_vmar(&self) -> Result<BorrowedFd<'_>, BuildError>;

    /// Commit. Returns the new process's handle.
    fn start(self) -> Result<Handle, BuildError>;
}

/// Creates builders scoped to a job.
pub trait BuilderFactory {
    type Builder: ContextBuilder;

    fn create(&self, job: Handle, name: &CStr) -> Result<Self::Builder, BuildError>;
}
