//! launcherd: process launcher daemon
//!
//! Listens on a `SOCK_SEQPACKET` socket and starts processes on behalf of
//! its clients. Single-threaded; every connection shares one io_uring.
//!
//! Usage:
//!     cargo build --release -p launcherd
//!     ./target/release/launcherd [socket-path]
//!
//! Environment:
//!     LAUNCHER_SOCKET            listening socket (default /tmp/launcher.sock)
//!     LAUNCHER_MAX_CONNECTIONS   connection limit (default 256)
//!     LAUNCHER_MAX_BATCH         messages per readiness event (default 64)
//!     LAUNCHER_SQ_ENTRIES        io_uring SQ size (default 256)
//!     LAUNCHER_BACKLOG           listen backlog (default 128)
//!     LAUNCHER_LOG_LEVEL         off|error|warn|info|debug|trace
//!
//! Stop with SIGINT or SIGTERM.

use launcher_core::{kerror, kinfo, kprint};
use launcher_executor::{LauncherConfig, Service};
use launcher_module::linux_spawn::LinuxSpawner;

fn main() {
    kprint::init();

    let mut config = LauncherConfig::from_env();
    if let Some(path) = std::env::args().nth(1) {
        config = config.socket_path(path);
    }
    kinfo!(
        "launcherd: max {} connections, batch {}, sq {}",
        config.max_connections,
        config.max_batch,
        config.sq_entries
    );

    let mut service = match Service::bind(config, LinuxSpawner::new()) {
        Ok(service) => service,
        Err(e) => {
            kerror!("launcherd: {}", e);
            std::process::exit(1);
        }
    };

    match service.run() {
        Ok(stats) => kinfo!("launcherd: stopped after {} launches", stats.launches_ok + stats.launches_failed),
        Err(e) => {
            kerror!("launcherd: {}", e);
            std::process::exit(1);
        }
    }
}
