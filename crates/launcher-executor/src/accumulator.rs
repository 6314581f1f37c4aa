//! Per-connection accumulation state.
//!
//! Everything a client sends before `Launch` lands here and is owned here
//! until the next launch takes it. The loader handle is kept out of band:
//! an `AddHandles` entry with `LOADER_SERVICE_ID` fills the loader slot and
//! never reaches the generic handle table.

use std::ffi::CString;

use launcher_core::handle::{handle_id, ty, Handle, StartupHandle, LOADER_SERVICE_ID};
use launcher_core::message::{HandleInfo, NameInfo};

#[derive(Debug, Default)]
pub struct AccumulationState {
    args: Vec<CString>,
    environs: Vec<CString>,
    names: Vec<CString>,
    handles: Vec<StartupHandle>,
    loader: Option<Handle>,
}

/// What one launch consumes, moved out of the state in a single step.
#[derive(Debug, Default)]
pub struct Accumulated {
    pub args: Vec<CString>,
    pub environs: Vec<CString>,
    /// Name table paths; entry `i` is the directory with id `NS_DIR | i`.
    pub names: Vec<CString>,
    pub handles: Vec<StartupHandle>,
    pub loader: Option<Handle>,
}

impl AccumulationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_args(&mut self, args: Vec<CString>) {
        self.args.extend(args);
    }

    pub fn add_environs(&mut self, environs: Vec<CString>) {
        self.environs.extend(environs);
    }

    /// Each directory takes the next name-table slot. Slots keep counting
    /// across calls until the state is cleared.
    pub fn add_names(&mut self, names: Vec<NameInfo>) {
        for NameInfo { path, directory } in names {
            let slot = self.names.len() as u32;
            self.handles.push(StartupHandle::new(handle_id(ty::NS_DIR, slot), directory));
            self.names.push(path);
        }
    }

    pub fn add_handles(&mut self, handles: Vec<HandleInfo>) {
        for HandleInfo { handle, id } in handles {
            if id == LOADER_SERVICE_ID {
                // Last one wins; the displaced loader closes here.
                self.loader = Some(handle);
            } else {
                self.handles.push(StartupHandle::new(id, handle));
            }
        }
    }

    /// Move everything out, leaving the state empty.
    pub fn take(&mut self) -> Accumulated {
        let state = std::mem::take(self);
        Accumulated {
            args: state.args,
            environs: state.environs,
            names: state.names,
            handles: state.handles,
            loader: state.loader,
        }
    }

    /// Drop everything accumulated, closing every held handle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
            && self.environs.is_empty()
            && self.names.is_empty()
            && self.handles.is_empty()
            && self.loader.is_none()
    }

    pub fn args(&self) -> &[CString] {
        &self.args
    }

    pub fn environs(&self) -> &[CString] {
        &self.environs
    }

    pub fn names(&self) -> &[CString] {
        &self.names
    }

    pub fn handles(&self) -> &[StartupHandle] {
        &self.handles
    }

    pub fn loader(&self) -> Option<&Handle> {
        self.loader.as_ref()
    }
}
