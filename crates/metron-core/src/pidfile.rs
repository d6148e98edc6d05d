//! Pidfile handling: single-instance locking, stale detection, and the
//! rename dance behind binary hot-swap.
//!
//! The master holds an exclusive flock on the pidfile for its whole life.
//! During a binary swap the file moves aside to `<path>.oldbin` so the new
//! master can claim the original path; a failed swap moves it back.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::error;

/// Error type for pidfile operations.
#[derive(Debug)]
pub enum PidFileError {
    /// I/O error creating or reading the file.
    Io(io::Error),
    /// Another process holds the lock.
    Lock(Errno),
    /// The file did not contain a pid; it has been removed.
    Corrupt(PathBuf),
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Io(e) => write!(f, "I/O error: {}", e),
            PidFileError::Lock(errno) => write!(f, "flock: {}", errno),
            PidFileError::Corrupt(path) => {
                write!(f, "removed corrupt pidfile {}", path.display())
            }
        }
    }
}

impl std::error::Error for PidFileError {}

impl From<io::Error> for PidFileError {
    fn from(e: io::Error) -> Self {
        PidFileError::Io(e)
    }
}

/// The master's pidfile, exclusively locked until dropped or removed.
pub struct PidFile {
    // Held for the lock, written once at creation.
    #[allow(dead_code)]
    lock: Flock<File>,
    base: PathBuf,
    at_oldbin: bool,
}

impl PidFile {
    /// Creates and locks the pidfile, writing our pid into it.
    ///
    /// Fails if the file already exists; callers are expected to have
    /// checked for a running instance with [`read_running`] first.
    pub fn create(path: &Path) -> Result<Self, PidFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(file, errno)| {
            drop(file);
            let _ = std::fs::remove_file(path);
            PidFileError::Lock(errno)
        })?;

        let mut writer: &File = &lock;
        if let Err(err) = writer.write_all(std::process::id().to_string().as_bytes()) {
            let _ = std::fs::remove_file(path);
            return Err(PidFileError::Io(err));
        }

        Ok(Self {
            lock,
            base: path.to_path_buf(),
            at_oldbin: false,
        })
    }

    /// Moves the pidfile aside so a new binary can claim the base path.
    pub fn rename_oldbin(&mut self) -> io::Result<()> {
        std::fs::rename(&self.base, oldbin_path(&self.base))?;
        self.at_oldbin = true;
        Ok(())
    }

    /// Undoes [`PidFile::rename_oldbin`] after a failed swap.
    pub fn restore(&mut self) -> io::Result<()> {
        std::fs::rename(oldbin_path(&self.base), &self.base)?;
        self.at_oldbin = false;
        Ok(())
    }

    /// Unlinks the pidfile from wherever it currently lives.
    pub fn remove(self) {
        let path = self.current_path();
        if let Err(err) = std::fs::remove_file(&path) {
            error!("remove pidfile {} failed: {}", path.display(), err);
        }
    }

    fn current_path(&self) -> PathBuf {
        if self.at_oldbin {
            oldbin_path(&self.base)
        } else {
            self.base.clone()
        }
    }
}

fn oldbin_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".oldbin");
    PathBuf::from(os)
}

/// Reads the pidfile and reports the recorded pid if that process is still
/// alive. Stale and corrupt files are removed; a corrupt file is still an
/// error so the caller can mention it.
pub fn read_running(path: &Path) -> Result<Option<u32>, PidFileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PidFileError::Io(err)),
    };
    let Ok(pid) = content.trim().parse::<u32>() else {
        let _ = std::fs::remove_file(path);
        return Err(PidFileError::Corrupt(path.to_path_buf()));
    };
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(Some(pid)),
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => Ok(Some(pid)),
        Err(_) => {
            let _ = std::fs::remove_file(path);
            Ok(None)
        }
    }
}
