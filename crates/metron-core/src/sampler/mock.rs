//! In-memory mock host for testing samplers without real `/proc`.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::sampler::traits::{FileSystem, FsUsage};

/// In-memory `FileSystem` for tests.
///
/// Stores file contents, statvfs answers and interface addresses in maps so
/// tests can replay any host state, including states that change between
/// refreshes (replace a file with `add_file` again).
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    usages: HashMap<PathBuf, FsUsage>,
    addresses: HashMap<String, Ipv4Addr>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a file with the given content.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        self.files
            .insert(path.as_ref().to_path_buf(), content.into());
    }

    /// Adds a statvfs answer for a mount point.
    pub fn add_usage(&mut self, mount: impl AsRef<Path>, usage: FsUsage) {
        self.usages.insert(mount.as_ref().to_path_buf(), usage);
    }

    /// Binds an IPv4 address to an interface name.
    pub fn add_interface(&mut self, name: impl Into<String>, addr: Ipv4Addr) {
        self.addresses.insert(name.into(), addr);
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock file not found: {}", path.display()),
            )
        })
    }

    fn filesystem_usage(&self, mount: &Path) -> io::Result<FsUsage> {
        self.usages.get(mount).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock mount not found: {}", mount.display()),
            )
        })
    }

    fn interface_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        self.addresses.get(name).copied()
    }
}
