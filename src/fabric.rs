//! Named event publishers auto-advertised via [`crate::discovery`];
//! subscribers auto-connect on a (user, application, event-type) match and
//! deliver parsed events (spec §4.4).

use crate::discovery::{DiscoveryClient, ServiceDescriptor};
use crate::error::FrameError;
use crate::framing::socket::{FramedSocket, TcpFramedSocket};
use crate::vitals::VitalCounter;
use chrono::Utc;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const SIGNATURE: &str = "EVTFBRC";
pub const SERVICE_NAME: &str = "EVENT";
pub const DEFAULT_EVENT_PORT_RANGE: RangeInclusive<u16> = 7000..=8000;

/// `{type, name, timestamp, user, application, payload[]}` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: String,
    pub name: String,
    pub timestamp_ns: u64,
    pub user: String,
    pub application: String,
    pub payload: Vec<String>,
}

impl EventRecord {
    /// `<type> <name> <timestamp> <user> <application> <payload...>`, the
    /// line format used both on the fabric wire and by the supervisor's
    /// child contract (spec §4.4, §6).
    pub fn to_line(&self) -> String {
        let mut parts = vec![
            self.event_type.clone(),
            self.name.clone(),
            self.timestamp_ns.to_string(),
            self.user.clone(),
            self.application.clone(),
        ];
        parts.extend(self.payload.iter().cloned());
        parts.join(" ")
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split(' ');
        let event_type = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let timestamp_ns = parts.next()?.parse().ok()?;
        let user = parts.next()?.to_string();
        let application = parts.next()?.to_string();
        let payload = parts.map(str::to_string).collect();
        Some(Self { event_type, name, timestamp_ns, user, application, payload })
    }
}

/// A cheap, clonable handle used by publishers and by the Vital Statistics
/// types to enqueue an event without awaiting delivery.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl EventEmitter {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<EventRecord>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, record: EventRecord) {
        let _ = self.tx.send(record);
    }
}

/// One fabric channel shared by every publisher with the same (user,
/// application); `publish` emits the wire line `<type> <name> <timestamp>
/// <user> <application> <payload...>` so subscribers can prefix-filter on
/// `event_type` cheaply.
#[derive(Clone)]
pub struct Publisher {
    user: String,
    application: String,
    service_name: String,
    emitter: EventEmitter,
    /// Set once the post-bind grace period (one full beacon period) has
    /// elapsed; sends before that point are still queued, just not
    /// guaranteed to reach a collector that hasn't subscribed yet.
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl Publisher {
    /// Binds a socket in `event_port_range`, advertises it via Discovery
    /// under `service_name = EVENT`, and waits `beacon_period` before
    /// reporting itself ready (spec §4.4 "Initialization delay").
    pub async fn bind(
        user: impl Into<String>,
        application: impl Into<String>,
        host: &str,
        event_port_range: RangeInclusive<u16>,
        beacon_period: Duration,
        discovery: &crate::discovery::DiscoveryServer,
        bad_header_counter: Arc<VitalCounter>,
    ) -> std::io::Result<Self> {
        let user = user.into();
        let application = application.into();
        let socket = TcpFramedSocket::bind(SIGNATURE, host, event_port_range, bad_header_counter).await?;
        let local = socket.local_addr().expect("bound socket has a local address");

        discovery.advertise(ServiceDescriptor {
            user: user.clone(),
            application: application.clone(),
            service_name: SERVICE_NAME.to_string(),
            location: format!("tcp://{}:{}", local.ip(), local.port()),
            identity: uuid::Uuid::new_v4().to_string(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
        let emitter = EventEmitter { tx };
        socket.bad_header_counter().attach(emitter.clone());
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ready_writer = ready.clone();

        let mut socket = socket;
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = record.to_line();
                if let Err(e) = socket.send(None, &[line.into_bytes()]).await {
                    warn!("event fabric send failed: {}", e);
                }
            }
        });

        tokio::spawn(async move {
            tokio::time::sleep(beacon_period).await;
            ready_writer.store(true, std::sync::atomic::Ordering::Relaxed);
        });

        Ok(Self {
            user,
            application,
            service_name: SERVICE_NAME.to_string(),
            emitter,
            ready,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    /// No-ops (with a warning) until [`Self::is_ready`] — the post-bind
    /// grace period is a correctness property, not an optimisation (spec
    /// §4.4 "Initialization delay"): publishing before it elapses could
    /// reach no subscriber, since none has had time to discover this
    /// publisher yet.
    pub fn publish(&self, event_name: &str, event_type: &str, payload: Vec<String>) {
        if !self.is_ready() {
            warn!(
                "publisher for {}:{} dropping '{}' before the discovery grace period elapsed",
                self.user, self.application, event_name
            );
            return;
        }
        self.emitter.emit(EventRecord {
            event_type: event_type.to_string(),
            name: event_name.to_string(),
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
            user: self.user.clone(),
            application: self.application.clone(),
            payload,
        });
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Subscribes to publishers discovered via Discovery whose `(user,
/// application)` match (empty filter means "any") and whose service name
/// is `EVENT`, delivering parsed [`EventRecord`]s through `callback`.
pub struct Collector {
    event_types: Vec<String>,
    user_filter: Option<String>,
    application_filter: Option<String>,
}

impl Collector {
    pub fn new(
        event_types: Vec<String>,
        user_filter: Option<String>,
        application_filter: Option<String>,
    ) -> Self {
        Self { event_types, user_filter, application_filter }
    }

    fn matches(&self, service: &ServiceDescriptor) -> bool {
        service.service_name == SERVICE_NAME
            && self.user_filter.as_deref().map_or(true, |u| u == service.user)
            && self.application_filter.as_deref().map_or(true, |a| a == service.application)
    }

    /// Drives subscription lifecycle from a discovery client's add/remove
    /// stream, connecting a [`TcpFramedSocket`] per matched service and
    /// forwarding parsed events to `callback` until the client is dropped.
    pub async fn run<F>(mut self, mut discovery: DiscoveryClient, callback: F)
    where
        F: Fn(EventRecord) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let mut active: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

        loop {
            match discovery.next_change().await {
                Some(crate::discovery::ServiceChange::Added(service)) => {
                    if !self.matches(&service) {
                        continue;
                    }
                    let key = service.identity.clone();
                    let event_types = self.event_types.clone();
                    let callback = callback.clone();
                    let location = service.location.clone();
                    let handle = tokio::spawn(async move {
                        if let Err(e) =
                            subscribe_and_relay(&location, &event_types, callback).await
                        {
                            debug!("event subscription to {} ended: {}", location, e);
                        }
                    });
                    active.insert(key, handle);
                }
                Some(crate::discovery::ServiceChange::Removed(service)) => {
                    if let Some(handle) = active.remove(&service.identity) {
                        handle.abort();
                    }
                }
                None => break,
            }
        }
    }
}

async fn subscribe_and_relay(
    location: &str,
    event_types: &[String],
    callback: Arc<dyn Fn(EventRecord) + Send + Sync>,
) -> Result<(), FrameError> {
    let (host, port) = crate::discovery::parse_tcp_location(location)
        .ok_or_else(|| FrameError::Malformed(format!("unsupported location {location}")))?;
    let counter = Arc::new(VitalCounter::new("rx_err_bad_header", "malformed frames dropped before dispatch"));
    let mut socket = TcpFramedSocket::connect(SIGNATURE, &host, port, counter).await?;

    if event_types.is_empty() {
        socket.subscribe("*");
    } else {
        for ty in event_types {
            socket.subscribe(ty);
        }
    }

    loop {
        let frame = match socket.recv().await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Some(line) = frame.header_str() else { continue };
        if let Some(record) = EventRecord::parse_line(line) {
            callback(record);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_round_trips() {
        let record = EventRecord {
            event_type: "USER".into(),
            name: "progress".into(),
            timestamp_ns: 12345,
            user: "sysadmin".into(),
            application: "strategy1".into(),
            payload: vec!["s".into(), "50%".into()],
        };
        let line = record.to_line();
        assert_eq!(line, "USER progress 12345 sysadmin strategy1 s 50%");
        assert_eq!(EventRecord::parse_line(&line).unwrap(), record);
    }
}
