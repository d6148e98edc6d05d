//! The update child: polls a central HTTP endpoint for the wanted agent
//! version and hands off to an installer program when it differs from the
//! running one.
//!
//! Versions travel as dotted strings ("1.2.3") and are packed into a
//! single integer, one byte per component, so the installer gets exactly
//! one numeric argument to act on.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::supervisor::ShutdownFlags;

#[derive(Debug)]
pub enum UpdateError {
    MissingUrl,
    Client(reqwest::Error),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::MissingUrl => write!(f, "update.url is not configured"),
            UpdateError::Client(err) => write!(f, "build http client: {}", err),
        }
    }
}

impl std::error::Error for UpdateError {}

#[derive(Debug, PartialEq, Eq)]
pub enum VersionError {
    Format,
    Range,
}

impl std::fmt::Display for VersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionError::Format => write!(f, "invalid version format"),
            VersionError::Range => write!(f, "subversion must less than 256"),
        }
    }
}

impl std::error::Error for VersionError {}

/// Packs a dotted version into one integer, one byte per component:
/// `"1.2.3"` becomes 0x010203. At most three components, each 0..=255.
/// Only the first line of `body` counts.
pub fn pack_version(body: &str) -> Result<u32, VersionError> {
    let line = body.split(['\r', '\n', '\0']).next().unwrap_or_default();
    let line = line.trim_matches([' ', '\t']);
    if line.is_empty() {
        return Err(VersionError::Format);
    }

    let mut version = 0u32;
    let mut count = 0;
    for component in line.split('.') {
        count += 1;
        if count > 3 {
            return Err(VersionError::Format);
        }
        let value: u32 = component.parse().map_err(|_| VersionError::Format)?;
        if value > 255 {
            return Err(VersionError::Range);
        }
        version = (version << 8) | value;
    }
    Ok(version)
}

/// Entry point of the update child. Returns only on configuration or
/// client construction failure; otherwise loops until shutdown.
pub fn run_update(config: &Config, flags: &ShutdownFlags) -> Result<(), UpdateError> {
    let Some(url) = config.update.url.as_deref() else {
        return Err(UpdateError::MissingUrl);
    };

    let current = match pack_version(env!("CARGO_PKG_VERSION")) {
        Ok(version) => version,
        Err(err) => {
            warn!("own version {} does not pack: {}", env!("CARGO_PKG_VERSION"), err);
            0
        }
    };

    let mut builder = reqwest::blocking::Client::builder()
        .user_agent(concat!("metrond/", env!("CARGO_PKG_VERSION")));
    builder = if config.connect_timeout > 0 {
        builder.connect_timeout(Duration::from_secs(config.connect_timeout))
    } else {
        builder
    };
    builder = if config.recv_timeout > 0 {
        builder.timeout(Duration::from_secs(config.recv_timeout))
    } else {
        builder.timeout(None)
    };
    let client = builder.build().map_err(UpdateError::Client)?;

    let check_url = format!(
        "{}?identify={}&version={}",
        url,
        config.identify,
        env!("CARGO_PKG_VERSION")
    );
    debug!("checking {} every {}s", check_url, config.check_interval);

    loop {
        if flags.shutting_down() {
            break;
        }
        if let Some(version) = check_once(&client, &check_url, current) {
            run_installer(&config.update.exe, version, flags);
        }
        if !flags.sleep(Duration::from_secs(config.check_interval)) {
            break;
        }
    }
    Ok(())
}

/// One poll of the update endpoint. Returns the packed version to install,
/// or `None` when nothing is to be done (failures included).
fn check_once(client: &reqwest::blocking::Client, url: &str, current: u32) -> Option<u32> {
    let response = match client.get(url).send() {
        Ok(response) => response,
        Err(err) => {
            warn!("update check failed: {}", err);
            return None;
        }
    };

    if !response.status().is_success() {
        warn!("HTTP code: {}", response.status().as_u16());
        return None;
    }

    let body = match response.text() {
        Ok(body) => body,
        Err(err) => {
            warn!("read update response failed: {}", err);
            return None;
        }
    };

    let version = match pack_version(&body) {
        Ok(version) => version,
        Err(err) => {
            warn!("{}: \"{}\"", err, body.trim());
            return None;
        }
    };

    if version == 0 {
        info!("update version is 0");
        return None;
    }
    if version == current {
        debug!("no update needed at version {}", env!("CARGO_PKG_VERSION"));
        return None;
    }
    Some(version)
}

/// Spawns the installer with the packed version as its single argument and
/// waits it out. A shutdown request forwards one SIGTERM to the installer
/// but we still wait for it to finish.
fn run_installer(exe: &Path, version: u32, flags: &ShutdownFlags) {
    info!("running {} {}", exe.display(), version);
    let mut child = match Command::new(exe).arg(version.to_string()).spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("spawn {} failed: {}", exe.display(), err);
            return;
        }
    };

    let mut signalled = false;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                match status.code() {
                    Some(code) => debug!("update process exited with code {}", code),
                    None => warn!("update process exited abnormally"),
                }
                break;
            }
            Ok(None) => {
                if flags.shutting_down() && !signalled {
                    signalled = true;
                    if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
                        warn!("terminate update process failed: {}", err);
                    }
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                error!("wait for update process failed: {}", err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread::JoinHandle;

    #[test]
    fn test_pack_version_three_components() {
        assert_eq!(pack_version("1.2.3"), Ok(0x010203));
        assert_eq!(pack_version("0.1.0"), Ok(0x000100));
    }

    #[test]
    fn test_pack_version_short_forms() {
        assert_eq!(pack_version("5"), Ok(5));
        assert_eq!(pack_version("0"), Ok(0));
        assert_eq!(pack_version("1.2"), Ok(0x0102));
    }

    #[test]
    fn test_pack_version_trims_and_stops_at_newline() {
        assert_eq!(pack_version(" 1.2 \n"), Ok(0x0102));
        assert_eq!(pack_version("1.2.3\r\nignored"), Ok(0x010203));
    }

    #[test]
    fn test_pack_version_rejects_garbage() {
        assert_eq!(pack_version(""), Err(VersionError::Format));
        assert_eq!(pack_version("abc"), Err(VersionError::Format));
        assert_eq!(pack_version("1.2.3.4"), Err(VersionError::Format));
        assert_eq!(pack_version("1..3"), Err(VersionError::Format));
        assert_eq!(pack_version("256"), Err(VersionError::Range));
        assert_eq!(pack_version("1.999.1"), Err(VersionError::Range));
    }

    fn serve_http_once(body: &'static str) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = String::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if request.contains("\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            request
        });
        (addr, handle)
    }

    #[test]
    fn test_check_once_reports_newer_version() {
        let (addr, handle) = serve_http_once("9.9.9\n");
        let client = reqwest::blocking::Client::new();
        let url = format!("http://{}/check?identify=box-1&version=0.1.0", addr);

        let current = pack_version("0.1.0").unwrap();
        assert_eq!(check_once(&client, &url, current), Some(0x090909));

        let request = handle.join().unwrap();
        assert!(request.contains("identify=box-1"));
        assert!(request.contains("version=0.1.0"));
    }

    #[test]
    fn test_check_once_skips_current_version() {
        let (addr, handle) = serve_http_once("0.1.0");
        let client = reqwest::blocking::Client::new();
        let url = format!("http://{}/check", addr);

        let current = pack_version("0.1.0").unwrap();
        assert_eq!(check_once(&client, &url, current), None);
        handle.join().unwrap();
    }

    #[test]
    fn test_run_installer_waits_for_exit() {
        let flags = ShutdownFlags::new();
        run_installer(Path::new("true"), 0x010203, &flags);
    }
}
