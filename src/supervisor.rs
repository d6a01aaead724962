//! Spawns and owns the lifetime of one user-supplied child process,
//! relaying its stdout/stderr and exit status back to the application-
//! control server (spec §4.8).

use crate::error::SupervisorError;
use crate::fabric::EventRecord;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the supervisor's monitor delivers to its owner (spec §4.8 "Relay").
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Stdout(String),
    Stderr(String),
    /// Delivered exactly once, when the child exits.
    Finished(i32),
}

/// Owns at most one child process at a time; one supervisor instance
/// controls one child payload (spec §1 Non-goals). `child` is shared with
/// the monitor task so both `stop`/`kill` and the exit-wait can reach it.
pub struct Supervisor {
    child: Option<Arc<tokio::sync::Mutex<Child>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { child: None, events: tx }, rx)
    }

    /// Spawns `command[0]` with the remaining entries as arguments,
    /// inheriting environment and working directory, and starts the
    /// dedicated monitor task that relays output and reports exit exactly
    /// once.
    pub async fn run(&mut self, command: Vec<String>) -> Result<(), SupervisorError> {
        let (program, args) = command.split_first().ok_or(SupervisorError::NotRunning)?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let shared = Arc::new(tokio::sync::Mutex::new(child));
        let events = self.events.clone();
        tokio::spawn(monitor(shared.clone(), stdout, stderr, events));
        self.child = Some(shared);
        Ok(())
    }

    /// Requests termination. `tokio::process::Child::start_kill` is the only
    /// portable handle tokio exposes; a real graceful SIGTERM would need a
    /// unix-only extension the reference implementation's target platform
    /// doesn't require.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let child = self.child.as_ref().ok_or(SupervisorError::NotRunning)?;
        child.lock().await.start_kill()?;
        Ok(())
    }

    pub async fn kill(&mut self) -> Result<(), SupervisorError> {
        self.stop().await
    }
}

async fn monitor(
    child: Arc<tokio::sync::Mutex<Child>>,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let out_events = events.clone();
    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                let _ = out_events.send(SupervisorEvent::Stdout(line));
            }
        }
    });

    let err_events = events.clone();
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                let _ = err_events.send(SupervisorEvent::Stderr(line));
            }
        }
    });

    let _ = tokio::join!(out_task, err_task);

    let status = child.lock().await.wait().await;
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!("failed to reap child: {}", e);
            -1
        }
    };
    let _ = events.send(SupervisorEvent::Finished(code));
}

/// Filesystem path an external child process connects to in order to push
/// fabric-format event lines for `{user}:{application}` (spec §4.8 "Event
/// proxying"). A real OS-level socket rather than an in-process channel, so
/// an actually-spawned payload process (not just Rust code in this binary)
/// can reach it, matching `zsocket.py`'s PULL-socket convention for the
/// same contract.
pub fn event_proxy_socket_path(address: &str) -> PathBuf {
    let sanitized = address.replace([':', '/'], "_");
    std::env::temp_dir().join(format!("app-control-events-{sanitized}.sock"))
}

/// Owns a Unix domain socket bound at `{user}:{application}`'s event-proxy
/// path (spec §4.8 "Event proxying"); any number of independently spawned
/// processes can connect to it and write fabric-format event lines. There
/// is no process-wide registry behind this — each connection binds and owns
/// its own proxy for the lifetime of that connection (spec §9 Design Notes,
/// "Global state": looked up explicitly by address, never through a hidden
/// static).
pub struct AppEventProxy {
    address: String,
    socket_path: PathBuf,
    listener: UnixListener,
}

impl AppEventProxy {
    /// Binds the socket immediately so the path exists as soon as this
    /// returns; `run` only accepts on it.
    pub fn bind(address: &str) -> std::io::Result<Self> {
        let socket_path = event_proxy_socket_path(address);
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        Ok(Self { address: address.to_string(), socket_path, listener })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Accepts connections until the process that called [`Self::bind`]
    /// gives up on it, reading newline-delimited fabric lines from each and
    /// handing every successfully parsed one to `on_event` — so a child
    /// process can never forge a header the fabric itself didn't construct
    /// (spec §4.8).
    pub async fn run<F>(self, on_event: F)
    where
        F: Fn(EventRecord) + Send + Sync + 'static,
    {
        let on_event = Arc::new(on_event);
        info!("event proxy {} listening on {}", self.address, self.socket_path.display());
        loop {
            let (stream, _) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("event proxy {}: accept failed: {}", self.address, e);
                    continue;
                }
            };
            let address = self.address.clone();
            let on_event = on_event.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => match EventRecord::parse_line(&line) {
                            Some(record) => on_event(record),
                            None => debug!("event proxy {}: dropping malformed line", address),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("event proxy {}: read error: {}", address, e);
                            break;
                        }
                    }
                }
            });
        }
    }
}
