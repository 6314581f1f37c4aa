//! # launcher-module: Default implementations
//!
//! This crate provides the default implementation for every launcher
//! trait. Each one favors a plain, well-understood kernel mechanism.
//!
//! ## Default stack
//!
//! | Trait            | Default Impl       | Mechanism                         |
//! |------------------|--------------------|-----------------------------------|
//! | Channel          | SeqpacketChannel   | `SOCK_SEQPACKET` + `SCM_RIGHTS`   |
//! | Codec            | WireCodec          | little-endian, handle markers     |
//! | Reactor          | UringReactor       | one-shot `IORING_OP_POLL_ADD`     |
//! | BuilderFactory   | LinuxSpawner       | fork + `fexecve`, cgroup jobs     |
//!
//! Supporting pieces: `loader` (LoadObject client), `elf` (interpreter
//! probe) and `signals` (signalfd source and child reaper).

pub mod sys;
pub mod wire_codec;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod seqpacket_channel;
        pub mod uring_reactor;
        pub mod elf;
        pub mod loader;
        pub mod linux_spawn;
        pub mod signals;
    } else {
        compile_error!("launcher-module requires Linux (io_uring, memfd, pidfd)");
    }
}
