//! Client side of the application-control protocol: drives one payload's
//! handshake, chunked transfer, run and stop lifecycle, and surfaces
//! observable events to its owner (spec §4.7 "Client states").

use super::{schema, MAJOR_VERSION, MINOR_VERSION, SIGNATURE};
use crate::env::Env;
use crate::framing::{FieldValue, Inbound};
use crate::protocol::engine::{EngineCtx, HandlerOutcome, ProtocolEngine, ProtocolHandlers};
use crate::protocol::{ActionEntry, KeepAliveEntry, MessageEntry, NullObserver, StateDef, TimeoutEntry, OVERLAY_STATE, SAME_STATE};
use crate::reactor::{self, ReactorHandle};
use crate::vitals::VitalCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Client-side tunables threaded through [`connect`] instead of the
/// crate-wide defaults, so a caller's `--chunk-size`/`--handshake-timeout`/
/// etc. actually reach the state table and the chunk pump (spec §6).
#[derive(Clone, Copy, Debug)]
pub struct ClientTuning {
    pub chunk_size: usize,
    pub window_size: usize,
    pub handshake_timeout: Duration,
    pub load_timeout: Duration,
    pub keepalive_period: Duration,
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            chunk_size: crate::defaults::CHUNK_SIZE,
            window_size: crate::defaults::WINDOW_SIZE,
            handshake_timeout: crate::defaults::HANDSHAKE_TIMEOUT,
            load_timeout: crate::defaults::LOAD_TIMEOUT,
            keepalive_period: crate::defaults::KEEPALIVE_PERIOD,
        }
    }
}

/// Observable events delivered to the owner of an [`AppControlClient`] (spec
/// §4.7). Every method defaults to a no-op so a caller only interested in a
/// subset need not implement the rest.
pub trait ClientObserver: Send {
    fn on_error(&mut self, _message: &str) {}
    fn on_ready(&mut self) {}
    fn on_loaded(&mut self, _file_name: &str, _md5: &str, _label: &str) {}
    fn on_running(&mut self) {}
    fn on_finished(&mut self, _exit_code: i64) {}
    fn on_stopped(&mut self) {}
    fn on_event(&mut self, _timestamp: &str, _event_type: &str, _event_name: &str, _data_type: &str, _data: &str) {}
}

/// The outstanding chunk window for one in-flight load (spec §9 Design
/// Notes "Coroutine-like control flow"): `pump_chunks` is called both right
/// after `LOAD_READY` and on every `CHUNK_OK`, each time topping the window
/// back up to `window_size`.
struct ChunkSession {
    file: tokio::fs::File,
    file_len: u64,
    sent: u64,
    started: bool,
    chunk_size: usize,
    window_size: usize,
    outstanding: usize,
}

struct AppControlClient {
    env: Env,
    tuning: ClientTuning,
    observer: Box<dyn ClientObserver>,
    loaded: Option<(String, String, String)>,
    /// `(file_name, md5, label)` sent in the last `LOAD`, checked against
    /// what the server echoes back on `LOAD_OK` (spec §4.7 LOADING).
    pending_load: Option<(String, String, String)>,
    chunk: Option<ChunkSession>,
}

impl AppControlClient {
    fn new(env: Env, tuning: ClientTuning, observer: Box<dyn ClientObserver>) -> Self {
        Self { env, tuning, observer, loaded: None, pending_load: None, chunk: None }
    }

    async fn send_howdy(&mut self, ctx: &mut EngineCtx<'_, '_>) {
        let _ = ctx
            .reply(&[
                b"HOWDY".to_vec(),
                self.env.user.clone().into_bytes(),
                FieldValue::Int(MAJOR_VERSION).to_raw(),
                FieldValue::Int(MINOR_VERSION).to_raw(),
            ])
            .await;
    }

    async fn handshake_timeout(&mut self) {
        self.observer.on_error("Timeout waiting for HI message response!");
    }

    async fn hi(&mut self, msg: &Inbound) -> HandlerOutcome {
        let major = msg.fields[0].as_int().unwrap_or_default();
        let state = msg.fields[2].as_str().unwrap_or("READY").to_string();
        let file_name = msg.fields[3].as_str().unwrap_or_default();
        let md5 = msg.fields[4].as_str().unwrap_or_default();
        let label = msg.fields[5].as_str().unwrap_or_default();

        if major != MAJOR_VERSION {
            self.observer.on_error(&format!("server speaks major version {major}, expected {MAJOR_VERSION}"));
            return HandlerOutcome::GoTo("ERROR".into());
        }

        if (state == "LOADED" || state == "RUNNING") && !file_name.is_empty() {
            self.loaded = Some((file_name.to_string(), md5.to_string(), label.to_string()));
        }
        match state.as_str() {
            "LOADED" => self.observer.on_loaded(file_name, md5, label),
            "RUNNING" => self.observer.on_running(),
            _ => self.observer.on_ready(),
        }
        HandlerOutcome::GoTo(state)
    }

    async fn start_loading(&mut self, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let file_name = args.first().and_then(FieldValue::as_str).unwrap_or_default().to_string();
        let label = args.get(1).and_then(FieldValue::as_str).unwrap_or_default().to_string();

        let bytes = match tokio::fs::read(&file_name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.observer.on_error(&format!("failed to read '{file_name}': {e}"));
                return HandlerOutcome::GoTo("ERROR".into());
            }
        };
        let digest = format!("{:x}", md5::compute(&bytes));
        self.pending_load = Some((file_name.clone(), digest.clone(), label.clone()));
        match ctx.reply(&[b"LOAD".to_vec(), file_name.into_bytes(), digest.into_bytes(), label.into_bytes()]).await {
            Ok(()) => HandlerOutcome::Ok,
            Err(e) => {
                self.observer.on_error(&format!("failed to send LOAD: {e}"));
                HandlerOutcome::Fail
            }
        }
    }

    async fn load_ready(&mut self, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let file_name = msg.fields[0].as_str().unwrap_or_default();
        let file = match tokio::fs::File::open(file_name).await {
            Ok(f) => f,
            Err(e) => {
                self.observer.on_error(&format!("failed to reopen '{file_name}' for chunking: {e}"));
                return HandlerOutcome::GoTo("ERROR".into());
            }
        };
        let file_len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        self.chunk = Some(ChunkSession {
            file,
            file_len,
            sent: 0,
            started: false,
            chunk_size: self.tuning.chunk_size,
            window_size: self.tuning.window_size,
            outstanding: 0,
        });
        self.pump_chunks(ctx).await;
        HandlerOutcome::Ok
    }

    async fn chunk_ok(&mut self, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        if let Some(session) = self.chunk.as_mut() {
            session.outstanding = session.outstanding.saturating_sub(1);
        }
        self.pump_chunks(ctx).await;
        HandlerOutcome::Ok
    }

    /// Tops the outstanding window back up to `window_size`, sending
    /// `is_last=true` on the chunk that reaches EOF.
    async fn pump_chunks(&mut self, ctx: &mut EngineCtx<'_, '_>) {
        loop {
            let Some(session) = self.chunk.as_mut() else { return };
            if session.outstanding >= session.window_size {
                return;
            }
            if session.started && session.sent >= session.file_len {
                return;
            }
            let remaining = session.file_len - session.sent;
            let take = remaining.min(session.chunk_size as u64) as usize;
            let mut buf = vec![0u8; take];
            if let Err(e) = session.file.seek(std::io::SeekFrom::Start(session.sent)).await {
                warn!("seek failed while chunking: {}", e);
                return;
            }
            if let Err(e) = session.file.read_exact(&mut buf).await {
                warn!("read failed while chunking: {}", e);
                return;
            }
            session.started = true;
            session.sent += take as u64;
            let is_last = session.sent >= session.file_len;
            session.outstanding += 1;
            let _ = ctx
                .reply(&[b"CHUNK".to_vec(), FieldValue::Bool(is_last).to_raw(), buf])
                .await;
        }
    }

    async fn load_timeout(&mut self) {
        self.observer.on_error("timed out waiting for LOAD_OK");
        self.chunk = None;
    }

    async fn load_ok(&mut self, msg: &Inbound) -> HandlerOutcome {
        let file_name = msg.fields[0].as_str().unwrap_or_default().to_string();
        let md5 = msg.fields[1].as_str().unwrap_or_default().to_string();
        let label = msg.fields[2].as_str().unwrap_or_default().to_string();
        self.chunk = None;

        let echoed = (file_name.clone(), md5.clone(), label.clone());
        if self.pending_load.as_ref() != Some(&echoed) {
            self.observer.on_error("server echoed a different file_name/md5/label on LOAD_OK");
            return HandlerOutcome::GoTo("ERROR".into());
        }

        self.loaded = Some(echoed);
        self.observer.on_loaded(&file_name, &md5, &label);
        HandlerOutcome::GoTo("LOADED".into())
    }

    async fn run_cmd(&mut self, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let command = args.first().and_then(FieldValue::as_str).unwrap_or_default().to_string();
        match ctx.reply(&[b"RUN".to_vec(), command.into_bytes()]).await {
            Ok(()) => HandlerOutcome::Ok,
            Err(e) => {
                self.observer.on_error(&format!("failed to send RUN: {e}"));
                HandlerOutcome::Fail
            }
        }
    }

    async fn run_ok(&mut self) -> HandlerOutcome {
        self.observer.on_running();
        HandlerOutcome::Ok
    }

    async fn stop_cmd(&mut self, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        match ctx.reply(&[b"STOP".to_vec()]).await {
            Ok(()) => HandlerOutcome::Ok,
            Err(e) => {
                self.observer.on_error(&format!("failed to send STOP: {e}"));
                HandlerOutcome::Fail
            }
        }
    }

    async fn stop_ok(&mut self) -> HandlerOutcome {
        self.observer.on_stopped();
        HandlerOutcome::Ok
    }

    async fn on_event(&mut self, msg: &Inbound) -> HandlerOutcome {
        let event_type = msg.fields[0].as_str().unwrap_or_default();
        let event_name = msg.fields[1].as_str().unwrap_or_default();
        let timestamp = msg.fields[2].as_str().unwrap_or_default();
        let data_type = msg.fields[3].as_str().unwrap_or_default();
        let data = msg.fields[4].as_str().unwrap_or_default();
        self.observer.on_event(timestamp, event_type, event_name, data_type, data);
        HandlerOutcome::Ok
    }

    async fn on_finished(&mut self, msg: &Inbound) -> HandlerOutcome {
        let exit_code = msg.fields[0].as_int().unwrap_or(-1);
        self.observer.on_finished(exit_code);
        HandlerOutcome::Ok
    }

    async fn on_error(&mut self, msg: &Inbound) -> HandlerOutcome {
        let message = msg.fields[0].as_str().unwrap_or_default();
        self.observer.on_error(message);
        HandlerOutcome::GoTo("ERROR".into())
    }

    async fn error_action(&mut self, args: &[FieldValue]) -> HandlerOutcome {
        let message = args.first().and_then(FieldValue::as_str).unwrap_or("internal error");
        self.observer.on_error(message);
        HandlerOutcome::GoTo("ERROR".into())
    }

    async fn quit_cmd(&mut self, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let _ = ctx.reply(&[b"QUIT".to_vec()]).await;
        ctx.close();
        HandlerOutcome::Ok
    }

    async fn keepalive_lost(&mut self) {
        self.observer.on_error("lost contact with server (keep-alive timed out)");
    }
}

#[async_trait]
impl ProtocolHandlers for AppControlClient {
    async fn on_enter(&mut self, handler: &str, ctx: &mut EngineCtx<'_, '_>) {
        if handler == "send_howdy" {
            self.send_howdy(ctx).await;
        }
    }

    async fn on_message(&mut self, handler: &str, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        match handler {
            "hi" => self.hi(msg).await,
            "load_ready" => self.load_ready(msg, ctx).await,
            "chunk_ok" => self.chunk_ok(ctx).await,
            "load_ok" => self.load_ok(msg).await,
            "run_ok" => self.run_ok().await,
            "stop_ok" => self.stop_ok().await,
            "on_event" => self.on_event(msg).await,
            "on_finished" => self.on_finished(msg).await,
            "on_error" => self.on_error(msg).await,
            other => {
                warn!("no handler named '{}'", other);
                HandlerOutcome::Fail
            }
        }
    }

    async fn on_action(&mut self, handler: &str, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        match handler {
            "start_loading" => self.start_loading(args, ctx).await,
            "run_cmd" => self.run_cmd(args, ctx).await,
            "stop_cmd" => self.stop_cmd(ctx).await,
            "quit_cmd" => self.quit_cmd(ctx).await,
            "error_action" => self.error_action(args).await,
            other => {
                warn!("no action handler named '{}'", other);
                HandlerOutcome::Fail
            }
        }
    }

    async fn on_timeout(&mut self, handler: &str, _ctx: &mut EngineCtx<'_, '_>) {
        match handler {
            "handshake_timeout" => self.handshake_timeout().await,
            "load_timeout" => self.load_timeout().await,
            _ => {}
        }
    }

    async fn on_keepalive_lost(&mut self, _handler: Option<&str>, _ctx: &mut EngineCtx<'_, '_>) {
        self.keepalive_lost().await;
    }
}

fn states(tuning: ClientTuning) -> Vec<StateDef> {
    vec![
        StateDef {
            name: "INIT",
            on_enter: Some("send_howdy"),
            messages: vec![MessageEntry { name: "HI", handler: "hi", next_state: SAME_STATE }],
            timeout: Some(TimeoutEntry { duration: tuning.handshake_timeout, handler: "handshake_timeout", next_state: "ERROR" }),
            ..Default::default()
        },
        StateDef {
            name: "READY",
            actions: vec![ActionEntry { name: "start_loading", handler: "start_loading", next_state: "LOADING", error_state: Some("ERROR") }],
            keepalive: Some(KeepAliveEntry { duration: tuning.keepalive_period, handler: None, next_state: "ERROR" }),
            ..Default::default()
        },
        StateDef {
            name: "LOADING",
            messages: vec![
                MessageEntry { name: "LOAD_READY", handler: "load_ready", next_state: SAME_STATE },
                MessageEntry { name: "CHUNK_OK", handler: "chunk_ok", next_state: SAME_STATE },
                MessageEntry { name: "LOAD_OK", handler: "load_ok", next_state: SAME_STATE },
            ],
            timeout: Some(TimeoutEntry { duration: tuning.load_timeout, handler: "load_timeout", next_state: "ERROR" }),
            ..Default::default()
        },
        StateDef {
            name: "LOADED",
            actions: vec![ActionEntry { name: "run", handler: "run_cmd", next_state: SAME_STATE, error_state: Some("ERROR") }],
            messages: vec![MessageEntry { name: "RUN_OK", handler: "run_ok", next_state: "RUNNING" }],
            keepalive: Some(KeepAliveEntry { duration: tuning.keepalive_period, handler: None, next_state: "ERROR" }),
            ..Default::default()
        },
        StateDef {
            name: "RUNNING",
            actions: vec![ActionEntry { name: "stop", handler: "stop_cmd", next_state: SAME_STATE, error_state: Some("ERROR") }],
            messages: vec![
                MessageEntry { name: "STOP_OK", handler: "stop_ok", next_state: "LOADED" },
                MessageEntry { name: "EVENT", handler: "on_event", next_state: SAME_STATE },
            ],
            keepalive: Some(KeepAliveEntry { duration: tuning.keepalive_period, handler: None, next_state: "ERROR" }),
            ..Default::default()
        },
        StateDef { name: "ERROR", ..Default::default() },
        StateDef { name: "DONE", ..Default::default() },
        StateDef {
            name: OVERLAY_STATE,
            messages: vec![
                MessageEntry { name: "FINISHED", handler: "on_finished", next_state: "LOADED" },
                MessageEntry { name: "ERROR", handler: "on_error", next_state: SAME_STATE },
            ],
            actions: vec![
                ActionEntry { name: "error", handler: "error_action", next_state: SAME_STATE, error_state: None },
                ActionEntry { name: "quit", handler: "quit_cmd", next_state: "DONE", error_state: None },
            ],
            ..Default::default()
        },
    ]
}

/// Connects to `host:port` with default tuning, runs the client's reactor,
/// and returns a handle an owner can use to drive
/// `start_loading`/`run`/`stop`/`quit` actions.
pub async fn connect(env: Env, host: &str, port: u16, observer: Box<dyn ClientObserver>) -> std::io::Result<ReactorHandle> {
    connect_with_tuning(env, host, port, ClientTuning::default(), observer).await
}

/// Like [`connect`] but with every chunking and timing tunable from spec
/// §6's configuration table under caller control.
pub async fn connect_with_tuning(
    env: Env,
    host: &str,
    port: u16,
    tuning: ClientTuning,
    observer: Box<dyn ClientObserver>,
) -> std::io::Result<ReactorHandle> {
    let bad_header_counter = Arc::new(VitalCounter::new("rx_err_bad_header", "malformed frames dropped before dispatch"));
    let socket = crate::framing::socket::TcpFramedSocket::connect(SIGNATURE, host, port, bad_header_counter).await?;

    let mut sockets = HashMap::new();
    sockets.insert(1u64, Box::new(socket) as Box<dyn crate::framing::socket::FramedSocket>);

    let handlers = AppControlClient::new(env, tuning, observer);
    let engine = ProtocolEngine::new("app-control-client", schema(), states(tuning), handlers, Box::new(NullObserver), 1)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(reactor::spawn(sockets, engine))
}
