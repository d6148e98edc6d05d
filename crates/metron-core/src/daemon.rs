//! Detaches the master from its controlling terminal.
//!
//! Must run before the pidfile is written (the pid changes across the
//! fork) and before any thread is spawned.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::process;

use nix::errno::Errno;
use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::unistd::{ForkResult, dup2, fork, setsid};

#[derive(Debug)]
pub enum DaemonError {
    Fork(Errno),
    Chdir(io::Error),
    Redirect(io::Error),
    Session(Errno),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Fork(errno) => write!(f, "fork: {}", errno),
            DaemonError::Chdir(err) => write!(f, "chdir /: {}", err),
            DaemonError::Redirect(err) => write!(f, "redirect stdio to /dev/null: {}", err),
            DaemonError::Session(errno) => write!(f, "setsid: {}", errno),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Forks into the background, points stdio at /dev/null and starts a new
/// session. The parent half exits inside this call.
pub fn daemonize() -> Result<(), DaemonError> {
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/").map_err(DaemonError::Chdir)?;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(DaemonError::Redirect)?;
    for fd in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        dup2(devnull.as_raw_fd(), fd)
            .map_err(io::Error::from)
            .map_err(DaemonError::Redirect)?;
    }

    setsid().map_err(DaemonError::Session)?;
    Ok(())
}
