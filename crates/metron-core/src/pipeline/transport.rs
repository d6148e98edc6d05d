//! Failover transport: ships envelopes to the first collector that answers.
//!
//! Wire protocol, per envelope: a 10-byte zero-padded ASCII decimal length,
//! the JSON payload, then a response that must start with `ok\n`. A
//! successful connection is kept open and tried first for the next
//! envelope; rotation resumes after the last good server, visiting every
//! address once per payload.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::warn;

use crate::config::ServerEntry;
use crate::supervisor::ShutdownFlags;

/// Error type for a payload no server accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// Every server failed for this payload.
    AllFailed,
    /// Shutdown was flagged mid-rotation.
    Aborted,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::AllFailed => write!(f, "all servers failed"),
            SendError::Aborted => write!(f, "send aborted by shutdown"),
        }
    }
}

impl std::error::Error for SendError {}

pub struct FailoverSender {
    servers: Vec<ServerEntry>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    conn: Option<TcpStream>,
    /// Index of the last server that accepted a payload; rotation starts
    /// after it.
    last_index: Option<usize>,
    flags: ShutdownFlags,
}

impl FailoverSender {
    /// Timeouts are in seconds; 0 disables the respective timeout.
    pub fn new(
        servers: Vec<ServerEntry>,
        connect_timeout: u64,
        send_timeout: u64,
        recv_timeout: u64,
        flags: ShutdownFlags,
    ) -> Self {
        Self {
            servers,
            connect_timeout: socket_timeout(connect_timeout),
            send_timeout: socket_timeout(send_timeout),
            recv_timeout: socket_timeout(recv_timeout),
            conn: None,
            last_index: None,
            flags,
        }
    }

    /// Delivers one payload to some server, reusing the open connection
    /// when there is one.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if let Some(mut stream) = self.conn.take() {
            let peer = self
                .last_index
                .and_then(|index| self.servers.get(index))
                .map(|server| server.display.clone())
                .unwrap_or_else(|| "?".to_string());
            if self.exchange(&mut stream, payload, &peer) {
                self.conn = Some(stream);
                return Ok(());
            }
            // Dropped here: a connection that failed mid-exchange is in an
            // unknown protocol state.
        }

        let count = self.servers.len();
        let start = self.last_index.map_or(0, |index| (index + 1) % count);
        for step in 0..count {
            let index = (start + step) % count;
            let server = &self.servers[index];

            let connect = match self.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&server.addr, timeout),
                None => TcpStream::connect(server.addr),
            };
            let mut stream = match connect {
                Ok(stream) => stream,
                Err(err) if is_timeout(&err) => {
                    warn!("connect to {} timeout", server.display);
                    continue;
                }
                Err(err) => {
                    warn!("connect to {} failed: {}", server.display, err);
                    if self.flags.shutting_down() {
                        return Err(SendError::Aborted);
                    }
                    continue;
                }
            };
            if let Err(err) = stream
                .set_write_timeout(self.send_timeout)
                .and_then(|_| stream.set_read_timeout(self.recv_timeout))
            {
                warn!("configure socket for {} failed: {}", server.display, err);
                continue;
            }

            if self.exchange(&mut stream, payload, &server.display) {
                self.conn = Some(stream);
                self.last_index = Some(index);
                return Ok(());
            }
        }

        warn!("send to all server failed");
        Err(SendError::AllFailed)
    }

    fn exchange(&self, stream: &mut TcpStream, payload: &[u8], peer: &str) -> bool {
        let header = format!("{:010}", payload.len());
        if !self.write_full(stream, header.as_bytes(), "header", peer) {
            return false;
        }
        if !self.write_full(stream, payload, "body", peer) {
            return false;
        }
        self.recv_ok(stream, peer)
    }

    fn write_full(&self, stream: &mut TcpStream, buf: &[u8], what: &str, peer: &str) -> bool {
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => {
                    warn!("send {} to {} failed: connection closed", what, peer);
                    return false;
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if self.flags.shutting_down() {
                        return false;
                    }
                }
                Err(err) if is_timeout(&err) => {
                    warn!("send {} to {} timeout", what, peer);
                    return false;
                }
                Err(err) => {
                    warn!("send {} to {} failed: {}", what, peer, err);
                    return false;
                }
            }
        }
        true
    }

    /// Reads until 3 response bytes have accumulated; only `ok\n` counts
    /// as acceptance.
    fn recv_ok(&self, stream: &mut TcpStream, peer: &str) -> bool {
        let mut buf = [0u8; 16];
        let mut len = 0;
        while len < 3 {
            match stream.read(&mut buf[len..]) {
                Ok(0) => {
                    warn!("invalid response from {}", peer);
                    return false;
                }
                Ok(n) => len += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if self.flags.shutting_down() {
                        return false;
                    }
                }
                Err(err) if is_timeout(&err) => {
                    warn!("recv response from {} timeout", peer);
                    return false;
                }
                Err(err) => {
                    warn!("recv response from {} failed: {}", peer, err);
                    return false;
                }
            }
        }
        if buf[..3] != *b"ok\n" {
            warn!("invalid response from {}", peer);
            return false;
        }
        true
    }
}

fn socket_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    fn entry(addr: SocketAddr) -> ServerEntry {
        ServerEntry {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
            display: addr.to_string(),
        }
    }

    /// Binds to an ephemeral port and immediately releases it, yielding an
    /// address that refuses connections.
    fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn read_envelope(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 10];
        stream.read_exact(&mut header).unwrap();
        let len: usize = std::str::from_utf8(&header).unwrap().parse().unwrap();
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    fn serve_once(listener: TcpListener, response: &'static [u8]) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let payload = read_envelope(&mut stream);
            stream.write_all(response).unwrap();
            payload
        })
    }

    #[test]
    fn test_rotation_reaches_live_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap();
        let server = serve_once(listener, b"ok\n");

        let servers = vec![entry(dead_addr()), entry(dead_addr()), entry(live)];
        let mut sender = FailoverSender::new(servers, 2, 2, 2, ShutdownFlags::new());

        sender.send(b"{\"host\":\"web-17\"}").unwrap();
        assert_eq!(sender.last_index, Some(2));
        assert_eq!(server.join().unwrap(), b"{\"host\":\"web-17\"}");
    }

    #[test]
    fn test_rejection_counts_as_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve_once(listener, b"no\n");

        let mut sender = FailoverSender::new(vec![entry(addr)], 2, 2, 2, ShutdownFlags::new());
        assert_eq!(sender.send(b"x"), Err(SendError::AllFailed));
        assert!(sender.last_index.is_none());
        server.join().unwrap();
    }

    #[test]
    fn test_connection_is_reused_across_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            // One accepted connection serves both payloads.
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                read_envelope(&mut stream);
                stream.write_all(b"ok\n").unwrap();
            }
        });

        let mut sender = FailoverSender::new(vec![entry(addr)], 2, 2, 2, ShutdownFlags::new());
        sender.send(b"first").unwrap();
        sender.send(b"second").unwrap();
        assert_eq!(sender.last_index, Some(0));
        server.join().unwrap();
    }

    #[test]
    fn test_all_dead_servers_fail() {
        let servers = vec![entry(dead_addr()), entry(dead_addr())];
        let mut sender = FailoverSender::new(servers, 1, 1, 1, ShutdownFlags::new());
        assert_eq!(sender.send(b"x"), Err(SendError::AllFailed));
    }
}
