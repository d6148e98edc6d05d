//! Process control for the supervisor: spawning, signalling and reaping
//! children, plus the termination escalation timer.
//!
//! The [`ProcessControl`] trait exists so the supervision loop can be
//! driven by a scripted implementation in tests; [`SystemControl`] is the
//! real one.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::error;

use crate::supervisor::Role;

/// Signals the supervisor sends to children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSignal {
    /// Fast shutdown.
    Term,
    /// Graceful shutdown.
    Quit,
    /// Forced kill after escalation.
    Kill,
}

/// Error type for signalling a child.
#[derive(Debug, PartialEq, Eq)]
pub enum SignalError {
    /// The process no longer exists.
    Gone,
    /// Any other kill(2) failure.
    Os(Errno),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Gone => write!(f, "no such process"),
            SignalError::Os(errno) => write!(f, "{}", errno),
        }
    }
}

impl std::error::Error for SignalError {}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
}

pub trait ProcessControl {
    /// Starts a child for `role`, returning its pid.
    fn spawn(&mut self, role: Role) -> io::Result<u32>;

    /// Re-executes our own argv, which after a pidfile swap runs whatever
    /// binary now sits at that path.
    fn spawn_new_binary(&mut self) -> io::Result<u32>;

    fn signal(&mut self, pid: u32, sig: ChildSignal) -> Result<(), SignalError>;

    /// Collects one exited child, or `None` when no more are waiting.
    fn reap(&mut self) -> Option<(u32, ExitKind)>;

    /// Arms (or re-arms) the escalation timer; SIGALRM is raised once
    /// `delay` elapses unless re-armed first.
    fn arm_timer(&mut self, delay: Duration);
}

pub struct SystemControl {
    config_path: PathBuf,
    /// Our own invocation, replayed for binary hot-swap.
    argv: Vec<OsString>,
    timer_gen: Arc<AtomicU64>,
}

impl SystemControl {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            argv: std::env::args_os().collect(),
            timer_gen: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn to_signal(sig: ChildSignal) -> Signal {
    match sig {
        ChildSignal::Term => Signal::SIGTERM,
        ChildSignal::Quit => Signal::SIGQUIT,
        ChildSignal::Kill => Signal::SIGKILL,
    }
}

impl ProcessControl for SystemControl {
    fn spawn(&mut self, role: Role) -> io::Result<u32> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg("--role")
            .arg(role.as_str())
            .arg("-c")
            .arg(&self.config_path)
            .spawn()?;
        Ok(child.id())
    }

    fn spawn_new_binary(&mut self) -> io::Result<u32> {
        let mut command = Command::new(&self.argv[0]);
        command.args(&self.argv[1..]);
        Ok(command.spawn()?.id())
    }

    fn signal(&mut self, pid: u32, sig: ChildSignal) -> Result<(), SignalError> {
        match kill(Pid::from_raw(pid as i32), to_signal(sig)) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::Gone),
            Err(errno) => Err(SignalError::Os(errno)),
        }
    }

    fn reap(&mut self) -> Option<(u32, ExitKind)> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Some((pid.as_raw() as u32, ExitKind::Code(code)));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Some((pid.as_raw() as u32, ExitKind::Signal(signal as i32)));
                }
                Ok(WaitStatus::StillAlive) => return None,
                // Stopped or continued children are not exits.
                Ok(_) => continue,
                Err(Errno::ECHILD) => return None,
                Err(errno) => {
                    error!("waitpid failed: {}", errno);
                    return None;
                }
            }
        }
    }

    fn arm_timer(&mut self, delay: Duration) {
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let timer_gen = Arc::clone(&self.timer_gen);
        thread::spawn(move || {
            thread::sleep(delay);
            // A newer arm supersedes this one.
            if timer_gen.load(Ordering::SeqCst) == generation {
                let _ = signal_hook::low_level::raise(signal_hook::consts::signal::SIGALRM);
            }
        });
    }
}
