//! Signal plumbing for the master process and its children.
//!
//! The master blocks on a [`MasterSignals`] iterator and treats every
//! delivered signal as one supervision event. Children install a watcher
//! thread that flips [`ShutdownFlags`] instead, so their worker loops can
//! poll for shutdown at their own pace.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use signal_hook::consts::signal::{
    SIGALRM, SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2,
};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::logging::LogWriter;

/// One wake-up of the master supervision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// A child changed state (SIGCHLD).
    Reap,
    /// Fast shutdown requested (SIGTERM, SIGINT).
    Terminate,
    /// Graceful shutdown requested (SIGQUIT).
    Quit,
    /// Reopen the log file (SIGHUP).
    Reopen,
    /// Swap to a new binary in place (SIGUSR2).
    ChangeBinary,
    /// The termination escalation timer fired (SIGALRM).
    Alarm,
}

/// Shared shutdown state for child processes.
///
/// `terminate` asks for a fast exit, `quit` for a graceful one. Worker
/// loops only ever check [`ShutdownFlags::shutting_down`]; the distinction
/// matters to the master alone.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlags {
    terminate: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

impl ShutdownFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutting_down(&self) -> bool {
        self.terminate.load(Ordering::Relaxed) || self.quit.load(Ordering::Relaxed)
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    /// Sleeps for `duration` in short slices, waking early on shutdown.
    ///
    /// # Returns
    ///
    /// `true` when the full duration elapsed, `false` when shutdown was
    /// observed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.shutting_down() {
                return false;
            }
            let slice = remaining.min(Duration::from_millis(100));
            thread::sleep(slice);
            remaining -= slice;
        }
        !self.shutting_down()
    }
}

fn classify(signal: i32) -> Option<SignalEvent> {
    match signal {
        SIGCHLD => Some(SignalEvent::Reap),
        SIGTERM | SIGINT => Some(SignalEvent::Terminate),
        SIGQUIT => Some(SignalEvent::Quit),
        SIGHUP => Some(SignalEvent::Reopen),
        SIGUSR2 => Some(SignalEvent::ChangeBinary),
        SIGALRM => Some(SignalEvent::Alarm),
        // SIGUSR1 is accepted so a stray kill does not terminate the
        // master, but it maps to no event.
        _ => None,
    }
}

fn log_signal(signal: i32) {
    info!(
        "signal {} ({}) received",
        signal,
        signal_hook::low_level::signal_name(signal).unwrap_or("?")
    );
}

/// Blocking signal source for the master process.
pub struct MasterSignals {
    inner: Signals,
}

impl MasterSignals {
    /// Installs the master's handlers. Must run before any child is
    /// spawned so no delivery window is left open.
    pub fn install() -> io::Result<Self> {
        ignore_sigpipe()?;
        let inner = Signals::new([
            SIGCHLD, SIGTERM, SIGINT, SIGQUIT, SIGHUP, SIGUSR1, SIGUSR2, SIGALRM,
        ])?;
        Ok(Self { inner })
    }

    /// Blocking iterator over supervision events, one per delivered signal.
    pub fn events(&mut self) -> impl Iterator<Item = SignalEvent> + '_ {
        self.inner.forever().filter_map(|signal| {
            log_signal(signal);
            classify(signal)
        })
    }
}

/// Installs the shutdown watcher for a child process.
///
/// TERM and INT request a fast exit, QUIT a graceful one, HUP reopens the
/// log file. The watcher thread runs for the life of the process.
pub fn install_child_signals(flags: ShutdownFlags, writer: LogWriter) -> io::Result<()> {
    ignore_sigpipe()?;
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                log_signal(signal);
                match signal {
                    SIGTERM | SIGINT => flags.request_terminate(),
                    SIGQUIT => flags.request_quit(),
                    SIGHUP => {
                        if let Err(err) = writer.reopen() {
                            error!("reopen log failed: {}", err);
                        }
                    }
                    _ => {}
                }
            }
        })?;
    Ok(())
}

/// Dead collector sockets must surface as EPIPE write errors, not kill
/// the process.
fn ignore_sigpipe() -> io::Result<()> {
    use nix::sys::signal::{SigHandler, Signal, signal};
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(io::Error::from)
}
