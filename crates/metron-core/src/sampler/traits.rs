//! Abstractions for host access to enable testing and mocking.
//!
//! The `FileSystem` trait covers everything the samplers ask the OS for:
//! `/proc` file reads, filesystem usage (statvfs) and interface addresses.
//! Tests swap in `MockFs` and run the samplers against fixture data on any
//! platform.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

/// Block counts of a mounted filesystem, as reported by `statvfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
}

/// Host access used by the samplers.
///
/// Implementations must be safe to call from the sampling thread while the
/// rest of the process runs; none of the methods may block indefinitely.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    ///
    /// # Arguments
    /// * `path` - Path to the file to read
    ///
    /// # Returns
    /// The file contents as a string, or an I/O error if the file cannot be read.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Queries block usage of the filesystem mounted at `mount`.
    ///
    /// # Arguments
    /// * `mount` - Mount point path
    ///
    /// # Returns
    /// Block counts, or an I/O error if the mount cannot be queried.
    fn filesystem_usage(&self, mount: &Path) -> io::Result<FsUsage>;

    /// Returns the IPv4 address bound to the named interface, if any.
    fn interface_ipv4(&self, name: &str) -> Option<Ipv4Addr>;
}

/// Real host implementation backed by `std::fs` and libc via `nix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn filesystem_usage(&self, mount: &Path) -> io::Result<FsUsage> {
        let stat = nix::sys::statvfs::statvfs(mount)?;
        Ok(FsUsage {
            blocks: stat.blocks() as u64,
            blocks_free: stat.blocks_free() as u64,
            blocks_available: stat.blocks_available() as u64,
        })
    }

    fn interface_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        let addrs = nix::ifaddrs::getifaddrs().ok()?;
        for ifaddr in addrs {
            if ifaddr.interface_name != name {
                continue;
            }
            if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                return Some(sin.ip());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_real_fs_read_to_string() {
        let fs = RealFs::new();
        let cargo_toml = env::current_dir().unwrap().join("Cargo.toml");
        let content = fs.read_to_string(&cargo_toml).unwrap();
        assert!(content.contains("[package]"));
    }

    #[test]
    fn test_real_fs_usage_of_root() {
        let fs = RealFs::new();
        let usage = fs.filesystem_usage(Path::new("/")).unwrap();
        assert!(usage.blocks > 0);
        assert!(usage.blocks >= usage.blocks_free);
    }

    #[test]
    fn test_unknown_interface_has_no_address() {
        let fs = RealFs::new();
        assert!(fs.interface_ipv4("definitely-not-a-nic0").is_none());
    }
}
