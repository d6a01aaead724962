//! Periodic UDP beacon emitter and receiver; maintains an age-out list of
//! live services (spec §4.3).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_BEACON_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_AGE_OUT: Duration = Duration::from_secs(40);

/// UDP port both `UdpBeaconTransport::bind` ends share for broadcasting and
/// listening for `BEACON` frames (spec §4.3, §6).
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;

/// `{user, application, service_name, location, identity}` (spec §3).
/// `identity` is the value that distinguishes otherwise-identical service
/// instances across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    pub user: String,
    pub application: String,
    pub service_name: String,
    pub location: String,
    pub identity: String,
}

/// The natural key for a service that ignores `identity`: two beacons
/// sharing this key but differing identity describe the same logical
/// service across a restart (spec §4.3 "Restart handling").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    user: String,
    application: String,
    service_name: String,
    location: String,
}

impl From<&ServiceDescriptor> for ServiceKey {
    fn from(s: &ServiceDescriptor) -> Self {
        Self {
            user: s.user.clone(),
            application: s.application.clone(),
            service_name: s.service_name.clone(),
            location: s.location.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServiceChange {
    Added(ServiceDescriptor),
    Removed(ServiceDescriptor),
}

/// Parses `(tcp|udp)://host:port`; `ipc://` and `inproc://` locations have
/// no port to extract and are rejected by this helper, which backs only
/// the event fabric's TCP subscription path.
pub fn parse_tcp_location(location: &str) -> Option<(String, u16)> {
    let rest = location.strip_prefix("tcp://").or_else(|| location.strip_prefix("udp://"))?;
    let (host, port) = rest.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

fn encode_beacon(service: &ServiceDescriptor) -> String {
    format!(
        "BEACON {} {} {} {} {}",
        service.identity, service.user, service.application, service.service_name, service.location
    )
}

fn decode_beacon(line: &str) -> Option<ServiceDescriptor> {
    let mut parts = line.split(' ');
    if parts.next()? != "BEACON" {
        return None;
    }
    Some(ServiceDescriptor {
        identity: parts.next()?.to_string(),
        user: parts.next()?.to_string(),
        application: parts.next()?.to_string(),
        service_name: parts.next()?.to_string(),
        location: parts.next()?.to_string(),
    })
}

/// Sends and receives beacon lines. Production code uses
/// [`UdpBeaconTransport`]; tests use an in-process broadcast so beacon
/// timing is deterministic and does not depend on the host's network
/// configuration allowing UDP broadcast.
#[async_trait::async_trait]
pub trait BeaconTransport: Send {
    async fn send(&self, line: &str);
    async fn recv(&mut self) -> Option<String>;
}

pub struct UdpBeaconTransport {
    socket: tokio::net::UdpSocket,
    broadcast_addr: SocketAddr,
}

impl UdpBeaconTransport {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", port))?;
        std_socket.set_nonblocking(true)?;
        let socket2 = socket2::Socket::from(std_socket);
        socket2.set_broadcast(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket2.into())?;
        Ok(Self {
            socket,
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], port)),
        })
    }
}

#[async_trait::async_trait]
impl BeaconTransport for UdpBeaconTransport {
    async fn send(&self, line: &str) {
        if let Err(e) = self.socket.send_to(line.as_bytes(), self.broadcast_addr).await {
            warn!("beacon send failed: {}", e);
        }
    }

    async fn recv(&mut self) -> Option<String> {
        let mut buf = [0u8; 1024];
        match self.socket.recv(&mut buf).await {
            Ok(n) => std::str::from_utf8(&buf[..n]).ok().map(str::to_string),
            Err(_) => None,
        }
    }
}

/// Emits a `BEACON` frame every `beacon_period` for each advertised
/// service (spec §4.3).
pub struct DiscoveryServer {
    advertised: Arc<Mutex<Vec<ServiceDescriptor>>>,
}

impl DiscoveryServer {
    pub fn start<T: BeaconTransport + 'static>(transport: T, beacon_period: Duration) -> Self {
        let advertised: Arc<Mutex<Vec<ServiceDescriptor>>> = Arc::new(Mutex::new(Vec::new()));
        let loop_advertised = advertised.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(beacon_period);
            loop {
                interval.tick().await;
                let services = loop_advertised.lock().unwrap().clone();
                for service in &services {
                    transport.send(&encode_beacon(service)).await;
                }
            }
        });
        Self { advertised }
    }

    pub fn advertise(&self, service: ServiceDescriptor) {
        self.advertised.lock().unwrap().push(service);
    }
}

struct KnownEntry {
    service: ServiceDescriptor,
    last_seen: Instant,
}

/// Maintains the age-out list of live services for one receiver and
/// exposes the `Added`/`Removed` stream (spec §4.3).
pub struct DiscoveryClient {
    rx: mpsc::UnboundedReceiver<ServiceChange>,
}

impl DiscoveryClient {
    pub fn start<T: BeaconTransport + 'static>(mut transport: T, age_out: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut known: HashMap<ServiceKey, KnownEntry> = HashMap::new();
            let mut age_check = tokio::time::interval(age_out / 4);
            loop {
                tokio::select! {
                    line = transport.recv() => {
                        let Some(line) = line else { break };
                        let Some(service) = decode_beacon(&line) else { continue };
                        let key = ServiceKey::from(&service);
                        let restarted = known
                            .get(&key)
                            .map(|e| e.service.identity != service.identity)
                            .unwrap_or(false);
                        if restarted {
                            let old = known.remove(&key).unwrap().service;
                            if tx.send(ServiceChange::Removed(old)).is_err() {
                                break;
                            }
                        }
                        let is_new = !known.contains_key(&key);
                        known.insert(key, KnownEntry { service: service.clone(), last_seen: Instant::now() });
                        if is_new || restarted {
                            if tx.send(ServiceChange::Added(service)).is_err() {
                                break;
                            }
                        }
                    }
                    _ = age_check.tick() => {
                        let now = Instant::now();
                        let stale: Vec<ServiceKey> = known
                            .iter()
                            .filter(|(_, e)| now.duration_since(e.last_seen) > age_out)
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in stale {
                            if let Some(entry) = known.remove(&key) {
                                debug!("service aged out: {:?}", entry.service);
                                if tx.send(ServiceChange::Removed(entry.service)).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
        Self { rx }
    }

    pub async fn next_change(&mut self) -> Option<ServiceChange> {
        self.rx.recv().await
    }
}

/// An in-process transport used by tests and by collectors/publishers that
/// live in the same process, bypassing real UDP broadcast entirely.
pub struct LoopbackBeaconTransport {
    tx: tokio::sync::broadcast::Sender<String>,
    rx: tokio::sync::broadcast::Receiver<String>,
}

impl LoopbackBeaconTransport {
    pub fn new_pair() -> (Self, Self) {
        let (tx, rx) = tokio::sync::broadcast::channel(256);
        let a = Self { tx: tx.clone(), rx: tx.subscribe() };
        let b = Self { tx, rx };
        (a, b)
    }

    /// A second sender wired to the same loopback bus, as if a second
    /// process (or a restarted one) were beaconing to the same receiver.
    pub fn new_sender(&self) -> Self {
        Self { tx: self.tx.clone(), rx: self.tx.subscribe() }
    }
}

#[async_trait::async_trait]
impl BeaconTransport for LoopbackBeaconTransport {
    async fn send(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(identity: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            user: "sysadmin".into(),
            application: "strategy1".into(),
            service_name: "EVENT".into(),
            location: "tcp://127.0.0.1:7000".into(),
            identity: identity.into(),
        }
    }

    #[tokio::test]
    async fn restart_emits_remove_then_add() {
        let (server_transport, client_transport) = LoopbackBeaconTransport::new_pair();
        let restart_transport = server_transport.new_sender();
        let server = DiscoveryServer::start(server_transport, Duration::from_millis(5));
        let mut client = DiscoveryClient::start(client_transport, Duration::from_secs(40));

        server.advertise(service("uuid-1"));
        let first = client.next_change().await.unwrap();
        assert!(matches!(first, ServiceChange::Added(s) if s.identity == "uuid-1"));

        // A second beaconer on the same bus, re-advertising the identical
        // (user, application, service, location) under a new identity,
        // simulates the service restarting at the same address.
        let second_server = DiscoveryServer::start(restart_transport, Duration::from_millis(5));
        second_server.advertise(service("uuid-2"));

        let removed = client.next_change().await.unwrap();
        assert!(matches!(removed, ServiceChange::Removed(s) if s.identity == "uuid-1"));
        let added = client.next_change().await.unwrap();
        assert!(matches!(added, ServiceChange::Added(s) if s.identity == "uuid-2"));
    }

    #[test]
    fn beacon_encode_decode_round_trip() {
        let s = service("uuid-1");
        let line = encode_beacon(&s);
        assert_eq!(line, "BEACON uuid-1 sysadmin strategy1 EVENT tcp://127.0.0.1:7000");
        assert_eq!(decode_beacon(&line).unwrap(), s);
    }
}
