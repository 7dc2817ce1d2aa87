//! Datagram session layer: the seam where the SRT library would sit.
//!
//! The relay core only depends on a handful of SRT properties: a handshake
//! carrying a stream-id string, per-connection socket descriptors a worker
//! can poll, datagram-preserving delivery of TS bundles, and a detectable
//! broken state. This module provides exactly those over nonblocking UDP
//! sockets:
//!
//! - A client sends `Hello { streamid }` to the listen port and retries
//!   until an answer arrives.
//! - The acceptor answers `Accept` from a freshly bound session socket, so
//!   the peer learns the per-connection port and every session owns its own
//!   fd; rejections answer `Reject` from the listen socket.
//! - Both sides then exchange `Data` datagrams; `Shutdown` or an ICMP
//!   error on the connected socket marks the session broken.
//!
//! Congestion control, retransmission, FEC, and encryption are the SRT
//! library's concern and are intentionally absent here.

pub mod packet;

use std::io;
use std::net::{ IpAddr, Ipv4Addr, SocketAddr, UdpSocket };
use std::os::unix::io::{ AsRawFd, RawFd };
use std::time::Duration;

use tracing::{ debug, trace, warn };

use crate::clock::monotonic_ms;
use crate::constants::{ HANDSHAKE_RETRIES, HANDSHAKE_TIMEOUT_MS, MAX_STREAMID_LEN };
use crate::error::{ RelayError, Result };
use self::packet::{ Packet, MAX_DATAGRAM };

/// Session liveness as seen by the owning role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Running,
    Broken,
}

/// One established session over its own UDP socket.
#[derive(Debug)]
pub struct Connection {
    socket: UdpSocket,
    peer: SocketAddr,
    latency_ms: u32,
    state: ConnState,
    shutdown_sent: bool,
}

impl Connection {
    fn new(socket: UdpSocket, peer: SocketAddr, latency_ms: u32) -> Self {
        Self {
            socket,
            peer,
            latency_ms,
            state: ConnState::Running,
            shutdown_sent: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnState::Broken
    }

    /// Receive the next data payload, if one is queued.
    ///
    /// Control packets are consumed transparently: `Shutdown` flips the
    /// session to `Broken`. Returns `Ok(None)` when the socket has nothing
    /// pending.
    pub fn recv_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        // Bounded drain so one chatty peer cannot monopolize a tick.
        for _ in 0..8 {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    match Packet::decode(&buf[..n]) {
                        Ok(Packet::Data(payload)) => {
                            return Ok(Some(payload));
                        }
                        Ok(Packet::Shutdown) => {
                            trace!(peer = %self.peer, "peer shut the session down");
                            self.state = ConnState::Broken;
                            return Err(RelayError::SocketBroken("peer shutdown".into()));
                        }
                        // Stray handshake duplicates are harmless.
                        Ok(_) => {
                            continue;
                        }
                        Err(e) => {
                            trace!(peer = %self.peer, error = %e, "dropping undecodable datagram");
                            continue;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(None);
                }
                Err(e) => {
                    self.state = ConnState::Broken;
                    return Err(RelayError::SocketBroken(e.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Send one data payload. Returns false on `WouldBlock`.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<bool> {
        let encoded = Packet::Data(payload.to_vec()).encode();
        match self.socket.send(&encoded) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                self.state = ConnState::Broken;
                Err(RelayError::SocketBroken(e.to_string()))
            }
        }
    }

    /// Notify the peer of an orderly teardown. Idempotent; errors ignored.
    pub fn send_shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        let _ = self.socket.send(&Packet::Shutdown.encode());
    }
}

/// A pending connection request observed on the listen socket.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub streamid: String,
    pub peer: SocketAddr,
    pub latency_ms: u32,
}

/// The listen-side socket accepting session handshakes on one UDP port.
pub struct Endpoint {
    socket: UdpSocket,
    port: u16,
    latency_ms: u32,
    /// Recently answered hellos, to absorb handshake retransmissions.
    recent: Vec<(SocketAddr, String, u64)>,
}

impl Endpoint {
    pub fn bind(port: u16, latency_ms: u32) -> Result<Endpoint> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        debug!(port, latency_ms, "listen endpoint bound");
        Ok(Endpoint {
            socket,
            port,
            latency_ms,
            recent: Vec::new(),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pull the next handshake request off the listen socket, if any.
    pub fn poll_hello(&mut self) -> Result<Option<HelloRequest>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    match Packet::decode(&buf[..n]) {
                        Ok(Packet::Hello { streamid, latency_ms }) => {
                            if streamid.len() > MAX_STREAMID_LEN {
                                warn!(%peer, "hello with oversized streamid dropped");
                                continue;
                            }
                            if self.is_duplicate(peer, &streamid) {
                                continue;
                            }
                            let latency_ms = if latency_ms == 0 {
                                self.latency_ms
                            } else {
                                latency_ms
                            };
                            return Ok(
                                Some(HelloRequest {
                                    streamid,
                                    peer,
                                    latency_ms,
                                })
                            );
                        }
                        Ok(other) => {
                            trace!(%peer, packet = ?other, "non-hello on listen socket dropped");
                        }
                        Err(e) => {
                            trace!(%peer, error = %e, "undecodable datagram on listen socket");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(RelayError::Io(e));
                }
            }
        }
    }

    /// Accept a pending request: bind a session socket, answer from it.
    pub fn accept(&mut self, request: &HelloRequest) -> Result<Connection> {
        let session = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        session.connect(request.peer)?;
        session.send(&(Packet::Accept { latency_ms: request.latency_ms }).encode())?;
        session.set_nonblocking(true)?;
        self.remember(request);
        debug!(
            peer = %request.peer,
            streamid = %request.streamid,
            session_port = session.local_addr()?.port(),
            "session accepted"
        );
        Ok(Connection::new(session, request.peer, request.latency_ms))
    }

    /// Reject a pending request from the listen socket.
    pub fn reject(&mut self, request: &HelloRequest, reason: &str) {
        self.remember(request);
        let encoded = (Packet::Reject { reason: reason.to_string() }).encode();
        if let Err(e) = self.socket.send_to(&encoded, request.peer) {
            warn!(peer = %request.peer, error = %e, "failed to send reject");
        }
    }

    fn is_duplicate(&self, peer: SocketAddr, streamid: &str) -> bool {
        let now = monotonic_ms();
        self.recent
            .iter()
            .any(
                |(p, s, t)|
                    *p == peer && s == streamid && now.saturating_sub(*t) < HANDSHAKE_TIMEOUT_MS
            )
    }

    fn remember(&mut self, request: &HelloRequest) {
        let now = monotonic_ms();
        self.recent.retain(|(_, _, t)| now.saturating_sub(*t) < HANDSHAKE_TIMEOUT_MS);
        self.recent.push((request.peer, request.streamid.clone(), now));
    }
}

/// Establish an outbound session: used by relay pullers/pushers and the
/// companion client. Blocks up to `HANDSHAKE_RETRIES x timeout` total.
pub fn connect(server: SocketAddr, streamid: &str, latency_ms: u32) -> Result<Connection> {
    if streamid.is_empty() || streamid.len() > MAX_STREAMID_LEN {
        return Err(RelayError::BadStreamId(streamid.to_string()));
    }
    let socket = UdpSocket::bind(bind_addr_for(server))?;
    let slice = Duration::from_millis(HANDSHAKE_TIMEOUT_MS / (HANDSHAKE_RETRIES as u64));
    socket.set_read_timeout(Some(slice))?;

    let hello = (Packet::Hello {
        streamid: streamid.to_string(),
        latency_ms,
    }).encode();

    let mut buf = [0u8; MAX_DATAGRAM];
    for attempt in 0..HANDSHAKE_RETRIES {
        socket.send_to(&hello, server)?;
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                match Packet::decode(&buf[..n]) {
                    Ok(Packet::Accept { latency_ms: granted }) => {
                        socket.connect(from)?;
                        socket.set_nonblocking(true)?;
                        debug!(%server, %from, streamid, "outbound session established");
                        return Ok(Connection::new(socket, from, granted));
                    }
                    Ok(Packet::Reject { reason }) => {
                        return Err(
                            RelayError::UpstreamUnreachable(format!("{server} rejected: {reason}"))
                        );
                    }
                    _ => {
                        trace!(%server, attempt, "unexpected handshake answer, retrying");
                    }
                }
            }
            Err(e) if
                e.kind() == io::ErrorKind::WouldBlock ||
                e.kind() == io::ErrorKind::TimedOut
            => {
                continue;
            }
            Err(e) => {
                return Err(RelayError::UpstreamUnreachable(format!("{server}: {e}")));
            }
        }
    }
    Err(RelayError::UpstreamUnreachable(format!("{server}: handshake timed out")))
}

fn bind_addr_for(server: SocketAddr) -> SocketAddr {
    match server.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn handshake_and_data_roundtrip() {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();

        let client = std::thread::spawn(move || {
            connect(localhost(port), "publish.example/live/demo", 0).unwrap()
        });

        // Server side: wait for the hello and accept it.
        let request = loop {
            if let Some(req) = endpoint.poll_hello().unwrap() {
                break req;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(request.streamid, "publish.example/live/demo");
        // Zero requested latency falls back to the endpoint default.
        assert_eq!(request.latency_ms, 100);
        let mut server_conn = endpoint.accept(&request).unwrap();

        let mut client_conn = client.join().unwrap();
        assert_eq!(client_conn.latency_ms(), 100);

        client_conn.send_payload(&[0x47; 188]).unwrap();
        let payload = loop {
            if let Some(p) = server_conn.recv_payload().unwrap() {
                break p;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(payload, vec![0x47; 188]);
    }

    #[test]
    fn reject_surfaces_reason() {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();

        let server = std::thread::spawn(move || {
            let request = loop {
                if let Some(req) = endpoint.poll_hello().unwrap() {
                    break req;
                }
                std::thread::sleep(Duration::from_millis(5));
            };
            endpoint.reject(&request, "no publisher");
        });

        let err = connect(localhost(port), "play.example/live/demo", 0).unwrap_err();
        server.join().unwrap();
        match err {
            RelayError::UpstreamUnreachable(msg) => assert!(msg.contains("no publisher")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn shutdown_breaks_the_session() {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();
        let client = std::thread::spawn(move || connect(localhost(port), "a/b/c", 0).unwrap());
        let request = loop {
            if let Some(req) = endpoint.poll_hello().unwrap() {
                break req;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        let mut server_conn = endpoint.accept(&request).unwrap();
        let mut client_conn = client.join().unwrap();

        client_conn.send_shutdown();
        let err = loop {
            match server_conn.recv_payload() {
                Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                Ok(Some(_)) => panic!("unexpected data"),
                Err(e) => {
                    break e;
                }
            }
        };
        assert!(matches!(err, RelayError::SocketBroken(_)));
        assert!(server_conn.is_broken());
    }

    #[test]
    fn duplicate_hello_is_absorbed() {
        let mut endpoint = Endpoint::bind(0, 100).unwrap();
        let port = endpoint.port();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hello = (Packet::Hello {
            streamid: "a/b/c".into(),
            latency_ms: 0,
        }).encode();
        raw.send_to(&hello, localhost(port)).unwrap();
        raw.send_to(&hello, localhost(port)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let first = loop {
            if let Some(req) = endpoint.poll_hello().unwrap() {
                break req;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        endpoint.accept(&first).unwrap();
        // The retransmitted hello must not surface as a second request.
        assert!(endpoint.poll_hello().unwrap().is_none());
    }
}
