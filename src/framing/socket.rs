//! Concrete [`FramedSocket`] implementations: a TCP binding capable of
//! router-style multi-client addressing, and an in-process pair channel for
//! the `pair-inproc` primitive the reactor and tests build on.

use super::codec;
use super::RawFrame;
use crate::error::FrameError;
use crate::vitals::VitalCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Operations every Framed Socket offers regardless of the underlying
/// transport (spec §4.1). A bound/connected socket is addressed by a
/// per-protocol `signature` supplied at construction time, so the trait
/// itself carries none of the signature-checking logic; that lives in
/// [`codec`].
#[async_trait]
pub trait FramedSocket: Send {
    /// Sends `fields` to `address` (the stashed last-reply-to peer for
    /// router channels, or ignored for a point-to-point connection).
    async fn send(&mut self, address: Option<&str>, fields: &[Vec<u8>]) -> Result<(), FrameError>;

    /// Waits for the next valid frame. Invalid frames are dropped inside the
    /// implementation per spec §4.1 (bumping a caller-visible counter is the
    /// caller's responsibility, surfaced via [`RecvError`]).
    async fn recv(&mut self) -> Result<RawFrame, RecvError>;

    /// Registers a prefix filter; frames whose header does not start with
    /// `prefix` are dropped by `recv` before being returned. The literal
    /// `*` subscribes to everything.
    fn subscribe(&mut self, prefix: &str);

    fn close(&mut self);
}

/// A non-fatal classification of what `recv` swallowed before finding (or
/// failing to find) a valid, subscription-matching frame.
#[derive(Debug)]
pub enum RecvError {
    /// The underlying transport is closed; no more frames will arrive.
    Closed,
    Io(std::io::Error),
}

impl From<std::io::Error> for RecvError {
    fn from(e: std::io::Error) -> Self {
        RecvError::Io(e)
    }
}

/// A stable, per-connection peer identity. For a router-type channel this
/// is what is carried in the `ADDR` field and what a client must stamp on
/// every outbound message so replies can be routed back (spec §4.1, §4.6).
pub type PeerId = String;

fn next_peer_id(counter: &AtomicU64) -> PeerId {
    format!("peer-{}", counter.fetch_add(1, Ordering::Relaxed))
}

/// A TCP-backed Framed Socket. In server mode it accepts arbitrarily many
/// connections and behaves as a router channel: every inbound frame's
/// `address` is the originating connection's [`PeerId`], and every `send`
/// with an explicit address routes to that connection rather than
/// broadcasting.
pub struct TcpFramedSocket {
    signature: &'static str,
    local_addr: Option<SocketAddr>,
    mode: Mode,
    prefixes: Vec<String>,
    rx_err_bad_header: Arc<VitalCounter>,
}

enum Mode {
    Server {
        connections: Arc<Mutex<HashMap<PeerId, WriteHalf<TcpStream>>>>,
        inbound: mpsc::Receiver<RawFrame>,
        peer_counter: Arc<AtomicU64>,
    },
    Client {
        writer: WriteHalf<TcpStream>,
        reader: Option<ReadHalf<TcpStream>>,
        inbound: mpsc::Receiver<RawFrame>,
    },
}

impl TcpFramedSocket {
    /// Binds the first available port in `ports`, ascending. Exhausting the
    /// whole range is a fatal configuration error (spec §4.1).
    pub async fn bind(
        signature: &'static str,
        host: &str,
        ports: RangeInclusive<u16>,
        bad_header_counter: Arc<VitalCounter>,
    ) -> std::io::Result<Self> {
        let mut last_err = None;
        for port in ports {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    let connections = Arc::new(Mutex::new(HashMap::new()));
                    let peer_counter = Arc::new(AtomicU64::new(1));
                    let (tx, rx) = mpsc::channel(256);
                    tokio::spawn(accept_loop(
                        listener,
                        signature,
                        connections.clone(),
                        peer_counter.clone(),
                        tx,
                        bad_header_counter.clone(),
                    ));
                    return Ok(Self {
                        signature,
                        local_addr: Some(local_addr),
                        mode: Mode::Server {
                            connections,
                            inbound: rx,
                            peer_counter,
                        },
                        prefixes: Vec::new(),
                        rx_err_bad_header: bad_header_counter,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port range exhausted")
        }))
    }

    pub async fn connect(
        signature: &'static str,
        host: &str,
        port: u16,
        bad_header_counter: Arc<VitalCounter>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(read_loop(read_half, signature, tx, bad_header_counter.clone()));
        Ok(Self {
            signature,
            local_addr: None,
            mode: Mode::Client {
                writer: write_half,
                reader: None,
                inbound: rx,
            },
            prefixes: Vec::new(),
            rx_err_bad_header: bad_header_counter,
        })
    }

    /// Wraps one already-accepted connection as a standalone, point-to-point
    /// Framed Socket (a reply-type channel, spec §4.6) rather than folding it
    /// into a shared router's connection table. Used by the application-
    /// control server, which runs one protocol engine per client connection.
    pub fn from_accepted(signature: &'static str, stream: TcpStream, bad_header_counter: Arc<VitalCounter>) -> Self {
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(read_loop(read_half, signature, tx, bad_header_counter.clone()));
        Self {
            signature,
            local_addr,
            mode: Mode::Client {
                writer: write_half,
                reader: None,
                inbound: rx,
            },
            prefixes: Vec::new(),
            rx_err_bad_header: bad_header_counter,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The shared counter this socket bumps on every dropped malformed
    /// frame, so an owner can attach it to a fabric publisher and have it
    /// flow through Vital Statistics like any other counter (spec §11
    /// supplement).
    pub fn bad_header_counter(&self) -> Arc<VitalCounter> {
        self.rx_err_bad_header.clone()
    }

    fn matches_subscription(&self, frame: &RawFrame) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let Some(header) = frame.header_str() else { return false };
        self.prefixes
            .iter()
            .any(|p| p == "*" || header.starts_with(p.as_str()))
    }
}

async fn accept_loop(
    listener: TcpListener,
    signature: &'static str,
    connections: Arc<Mutex<HashMap<PeerId, WriteHalf<TcpStream>>>>,
    peer_counter: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<RawFrame>,
    bad_header_counter: Arc<VitalCounter>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        let peer = next_peer_id(&peer_counter);
        let (read_half, write_half) = tokio::io::split(stream);
        connections.lock().await.insert(peer.clone(), write_half);
        tokio::spawn(connection_loop(
            peer,
            read_half,
            signature,
            inbound_tx.clone(),
            connections.clone(),
            bad_header_counter.clone(),
        ));
    }
}

async fn connection_loop(
    peer: PeerId,
    mut reader: ReadHalf<TcpStream>,
    signature: &'static str,
    inbound_tx: mpsc::Sender<RawFrame>,
    connections: Arc<Mutex<HashMap<PeerId, WriteHalf<TcpStream>>>>,
    bad_header_counter: Arc<VitalCounter>,
) {
    loop {
        match codec::read_frame(&mut reader, signature).await {
            Ok(mut frame) => {
                frame.address = Some(peer.clone());
                if inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(FrameError::Io(_)) => break,
            Err(e) => {
                debug!("dropping malformed frame from {}: {}", peer, e);
                bad_header_counter.add(1);
            }
        }
    }
    connections.lock().await.remove(&peer);
}

async fn read_loop<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    signature: &'static str,
    inbound_tx: mpsc::Sender<RawFrame>,
    bad_header_counter: Arc<VitalCounter>,
) {
    loop {
        match codec::read_frame(&mut reader, signature).await {
            Ok(frame) => {
                if inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(FrameError::Io(_)) => break,
            Err(e) => {
                debug!("dropping malformed frame: {}", e);
                bad_header_counter.add(1);
            }
        }
    }
}

#[async_trait]
impl FramedSocket for TcpFramedSocket {
    async fn send(&mut self, address: Option<&str>, fields: &[Vec<u8>]) -> Result<(), FrameError> {
        match &mut self.mode {
            Mode::Server { connections, .. } => {
                let peer = address.ok_or_else(|| {
                    FrameError::Malformed("server send requires a stashed peer address".into())
                })?;
                let mut conns = connections.lock().await;
                let writer = conns
                    .get_mut(peer)
                    .ok_or_else(|| FrameError::Malformed(format!("unknown peer {peer}")))?;
                codec::write_frame(writer, self.signature, None, fields).await
            }
            Mode::Client { writer, .. } => {
                codec::write_frame(writer, self.signature, address, fields).await
            }
        }
    }

    async fn recv(&mut self) -> Result<RawFrame, RecvError> {
        loop {
            let frame = match &mut self.mode {
                Mode::Server { inbound, .. } => inbound.recv().await,
                Mode::Client { inbound, .. } => inbound.recv().await,
            };
            let frame = frame.ok_or(RecvError::Closed)?;
            if self.matches_subscription(&frame) {
                return Ok(frame);
            }
        }
    }

    fn subscribe(&mut self, prefix: &str) {
        self.prefixes.push(prefix.to_string());
    }

    fn close(&mut self) {
        match &mut self.mode {
            Mode::Server { connections, .. } => {
                let connections = connections.clone();
                tokio::spawn(async move {
                    connections.lock().await.clear();
                });
            }
            Mode::Client { .. } => {}
        }
    }
}

/// A pair-inproc channel: exactly two endpoints, no signature checking (both
/// sides are the same process), used for the reactor's command pipe and for
/// local push/pull wiring such as the supervisor's event proxy.
pub struct PairFramedSocket {
    tx: mpsc::Sender<RawFrame>,
    rx: mpsc::Receiver<RawFrame>,
}

impl PairFramedSocket {
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(buffer);
        let (tx_b, rx_a) = mpsc::channel(buffer);
        (
            Self { tx: tx_a, rx: rx_a },
            Self { tx: tx_b, rx: rx_b },
        )
    }
}

#[async_trait]
impl FramedSocket for PairFramedSocket {
    async fn send(&mut self, _address: Option<&str>, fields: &[Vec<u8>]) -> Result<(), FrameError> {
        self.tx
            .send(RawFrame { address: None, fields: fields.to_vec() })
            .await
            .map_err(|_| FrameError::Malformed("peer dropped".into()))
    }

    async fn recv(&mut self) -> Result<RawFrame, RecvError> {
        self.rx.recv().await.ok_or(RecvError::Closed)
    }

    fn subscribe(&mut self, _prefix: &str) {}

    fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Arc<VitalCounter> {
        Arc::new(VitalCounter::new("rx_err_bad_header", "malformed frames dropped before dispatch"))
    }

    #[tokio::test]
    async fn pair_round_trip() {
        let (mut a, mut b) = PairFramedSocket::pair(8);
        a.send(None, &[b"HOWDY".to_vec(), b"alice".to_vec()]).await.unwrap();
        let frame = b.recv().await.unwrap();
        assert_eq!(frame.fields[0], b"HOWDY");
        assert_eq!(frame.fields[1], b"alice");
    }

    #[tokio::test]
    async fn tcp_bind_exhausts_range() {
        // Reserve a single port by binding it directly, then ask for the
        // same single-port range: the whole range is exhausted.
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let result = TcpFramedSocket::bind("SIG", "127.0.0.1", port..=port, counter()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tcp_round_trip_client_server() {
        let counter = counter();
        let mut server = TcpFramedSocket::bind("SIG", "127.0.0.1", 0..=0, counter.clone())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = TcpFramedSocket::connect("SIG", "127.0.0.1", port, counter)
            .await
            .unwrap();

        client
            .send(None, &[b"HOWDY".to_vec(), b"sysadmin".to_vec(), b"1".to_vec(), b"0".to_vec()])
            .await
            .unwrap();
        let frame = server.recv().await.unwrap();
        assert_eq!(frame.fields[0], b"HOWDY");
        let peer = frame.address.clone().unwrap();

        server.send(Some(&peer), &[b"HI".to_vec()]).await.unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.fields[0], b"HI");
    }
}
