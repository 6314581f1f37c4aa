//! `Launchpad`: sticky-error wrapper around a `ContextBuilder`.
//!
//! The launch sequence is a straight line of builder steps. The first
//! failing step records its error and drops the builder, releasing every
//! resource it had been given; later steps become no-ops that drop their
//! own arguments. `go()` reports the first error or commits.

use std::ffi::CStr;

use launcher_core::builder::{BuilderFactory, CStrArray, ContextBuilder};
use launcher_core::error::BuildError;
use launcher_core::handle::{Handle, StartupHandle};
use launcher_core::status::Status;

pub struct Launchpad<B: ContextBuilder> {
    builder: Option<B>,
    error: Option<BuildError>,
    root_vmar: Option<Handle>,
}

impl<B: ContextBuilder> Launchpad<B> {
    pub fn create<F>(factory: &F, job: Handle, name: &CStr) -> Self
    where
        F: BuilderFactory<Builder = B>,
    {
        match factory.create(job, name) {
            Ok(builder) => Self { builder: Some(builder), error: None, root_vmar: None },
            Err(e) => Self { builder: None, error: Some(e), root_vmar: None },
        }
    }

    /// Fail the sequence unless it has already failed.
    pub fn abort(&mut self, status: Status, message: &str) {
        if self.error.is_none() {
            self.fail(BuildError::new(status, message));
        }
    }

    fn fail(&mut self, err: BuildError) {
        self.error = Some(err);
        self.builder = None;
        self.root_vmar = None;
    }

    fn step<T>(&mut self, f: impl FnOnce(&mut B) -> Result<T, BuildError>) -> Option<T> {
        let builder = self.builder.as_mut()?;
        match f(builder) {
            Ok(v) => Some(v),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    /// Returns the resolver the builder displaced, if any.
    pub fn use_loader_service(&mut self, loader: Handle) -> Option<Handle> {
        self.step(|b| Ok(b.use_loader_service(loader))).flatten()
    }

    pub fn load_from_image(&mut self, image: Handle) {
        self.step(|b| b.load_from_image(image));
    }

    pub fn set_args(&mut self, args: &CStrArray) {
        self.step(|b| b.set_args(args));
    }

    pub fn set_environ(&mut self, environ: &CStrArray) {
        self.step(|b| b.set_environ(environ));
    }

    pub fn set_nametable(&mut self, names: &CStrArray) {
        self.step(|b| b.set_nametable(names));
    }

    pub fn add_handles(&mut self, handles: Vec<StartupHandle>) {
        self.step(|b| b.add_handles(handles));
    }

    /// Duplicate the builder's root memory region so the copy outlives
    /// commit. Must run before `go()`.
    pub fn duplicate_root_vmar(&mut self) {
        let dup = self.step(|b| {
            let region = b.root_vmar()?;
            region.try_clone_to_owned().map_err(|e| {
                BuildError::new(Status::from_io_error(&e), "failed to get root vmar")
            })
        });
        self.root_vmar = dup;
    }

    /// Commit. Returns the process handle and the duplicated root region.
    pub fn go(mut self) -> Result<(Handle, Handle), BuildError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let builder = self
            .builder
            .take()
            .ok_or_else(|| BuildError::new(Status::BAD_STATE, "no builder"))?;
        let root_vmar = self
            .root_vmar
            .take()
            .ok_or_else(|| BuildError::new(Status::BAD_STATE, "root vmar not duplicated"))?;
        let process = builder.start()?;
        Ok((process, root_vmar))
    }
}
