//! Server side of the application-control protocol: accepts connections and
//! runs one protocol engine per conversation (spec §4.6 "reply-type
//! channel", §4.7 "Server states", §5 "one reactor thread per instance").

use super::{schema, MAJOR_VERSION, MINOR_VERSION, SIGNATURE};
use crate::env::Env;
use crate::error::AppControlError;
use crate::fabric::Publisher;
use crate::framing::socket::TcpFramedSocket;
use crate::framing::{FieldValue, Inbound};
use crate::protocol::engine::{EngineCtx, HandlerOutcome, ProtocolEngine, ProtocolHandlers};
use crate::protocol::{ActionEntry, MessageEntry, NullObserver, StateDef, TimeoutEntry, OVERLAY_STATE, SAME_STATE};
use crate::reactor::{self, ReactorHandle};
use crate::supervisor::{AppEventProxy, Supervisor, SupervisorEvent};
use crate::vitals::VitalCounter;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// A payload currently being written to disk, live only while the
/// connection's engine is in `LOADING` (spec §5 "Shared resources": the
/// file is owned exclusively by this session for its lifetime).
struct LoadSession {
    file_name: String,
    expected_md5: String,
    label: String,
    writer: BufWriter<tokio::fs::File>,
}

/// One client conversation's handlers. A fresh instance is built per
/// accepted connection; nothing here is shared across connections except
/// the [`Env`] identity and the server's configured load timeout.
struct AppControlServer {
    env: Env,
    load_timeout: Duration,
    loaded: Option<(String, String, String)>,
    session: Option<LoadSession>,
    supervisor: Supervisor,
}

impl AppControlServer {
    fn new(env: Env, load_timeout: Duration) -> (Self, tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (supervisor, events) = Supervisor::new();
        (
            Self { env, load_timeout, loaded: None, session: None, supervisor },
            events,
        )
    }

    async fn reply_error(&self, ctx: &mut EngineCtx<'_, '_>, message: impl Into<String>) {
        let _ = ctx.reply(&[b"ERROR".to_vec(), message.into().into_bytes()]).await;
    }

    async fn howdy(&mut self, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let user = msg.fields[0].as_str().unwrap_or_default();
        let major = msg.fields[1].as_int().unwrap_or_default();
        let _minor = msg.fields[2].as_int().unwrap_or_default();

        if user != self.env.user {
            warn!("rejecting HOWDY from '{}': expected user '{}'", user, self.env.user);
            self.reply_error(ctx, AppControlError::UserMismatch.to_string()).await;
            return HandlerOutcome::Fail;
        }
        if major != MAJOR_VERSION {
            self.reply_error(ctx, format!("Unsupported major version {major}")).await;
            return HandlerOutcome::Fail;
        }

        let (file_name, md5, label) = self.loaded.clone().unwrap_or_default();
        let fields = vec![
            FieldValue::Int(MAJOR_VERSION).to_raw(),
            FieldValue::Int(MINOR_VERSION).to_raw(),
            ctx.current_state().as_bytes().to_vec(),
            file_name.into_bytes(),
            md5.into_bytes(),
            label.into_bytes(),
        ];
        let mut out = vec![b"HI".to_vec()];
        out.extend(fields);
        let _ = ctx.reply(&out).await;
        HandlerOutcome::Ok
    }

    async fn load(&mut self, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let file_name = msg.fields[0].as_str().unwrap_or_default().to_string();
        let expected_md5 = msg.fields[1].as_str().unwrap_or_default().to_string();
        let label = msg.fields[2].as_str().unwrap_or_default().to_string();

        if let Ok(bytes) = tokio::fs::read(&file_name).await {
            let digest = format!("{:x}", md5::compute(&bytes));
            if digest == expected_md5 {
                self.loaded = Some((file_name.clone(), expected_md5.clone(), label.clone()));
                let _ = ctx
                    .reply(&[b"LOAD_OK".to_vec(), file_name.into_bytes(), expected_md5.into_bytes(), label.into_bytes()])
                    .await;
                return HandlerOutcome::GoTo("LOADED".into());
            }
        }

        match tokio::fs::File::create(&file_name).await {
            Ok(file) => {
                self.session = Some(LoadSession {
                    file_name: file_name.clone(),
                    expected_md5: expected_md5.clone(),
                    label: label.clone(),
                    writer: BufWriter::new(file),
                });
                let _ = ctx
                    .reply(&[b"LOAD_READY".to_vec(), file_name.into_bytes(), expected_md5.into_bytes(), label.into_bytes()])
                    .await;
                HandlerOutcome::GoTo("LOADING".into())
            }
            Err(e) => {
                self.reply_error(ctx, AppControlError::FileOpen(e.to_string()).to_string()).await;
                HandlerOutcome::Fail
            }
        }
    }

    async fn chunk(&mut self, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let is_last = msg.fields[0].as_bool().unwrap_or(false);
        let data = msg.fields[1].as_bytes().unwrap_or_default();

        let Some(session) = self.session.as_mut() else {
            warn!("CHUNK with no active load session");
            return HandlerOutcome::Fail;
        };
        if let Err(e) = session.writer.write_all(data).await {
            warn!("failed writing chunk to '{}': {}", session.file_name, e);
            self.reply_error(ctx, AppControlError::FileOpen(e.to_string()).to_string()).await;
            self.session = None;
            return HandlerOutcome::GoTo("READY".into());
        }

        if !is_last {
            let _ = ctx.reply(&[b"CHUNK_OK".to_vec()]).await;
            return HandlerOutcome::Ok;
        }

        let mut session = self.session.take().expect("checked above");
        if let Err(e) = session.writer.flush().await {
            warn!("failed flushing '{}': {}", session.file_name, e);
        }
        let digest = match tokio::fs::read(&session.file_name).await {
            Ok(bytes) => format!("{:x}", md5::compute(&bytes)),
            Err(_) => String::new(),
        };
        if digest != session.expected_md5 {
            ctx.fire_action("error", vec![FieldValue::Str(AppControlError::Md5Mismatch.to_string())]);
            return HandlerOutcome::Fail;
        }

        self.loaded = Some((session.file_name.clone(), session.expected_md5.clone(), session.label.clone()));
        let _ = ctx
            .reply(&[
                b"LOAD_OK".to_vec(),
                session.file_name.into_bytes(),
                session.expected_md5.into_bytes(),
                session.label.into_bytes(),
            ])
            .await;
        HandlerOutcome::GoTo("LOADED".into())
    }

    async fn load_timeout(&mut self, _ctx: &mut EngineCtx<'_, '_>) {
        warn!("load of '{}' timed out", self.session.as_ref().map(|s| s.file_name.as_str()).unwrap_or("?"));
        self.session = None;
    }

    async fn run(&mut self, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let command = msg.fields[0].as_str().unwrap_or_default();
        match self.supervisor.run(command.split_whitespace().map(str::to_string).collect()).await {
            Ok(()) => {
                let _ = ctx.reply(&[b"RUN_OK".to_vec()]).await;
                HandlerOutcome::Ok
            }
            Err(e) => {
                self.reply_error(ctx, AppControlError::Other(e.to_string()).to_string()).await;
                HandlerOutcome::Fail
            }
        }
    }

    async fn stop(&mut self, _msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        if let Err(e) = self.supervisor.kill().await {
            warn!("stop requested with no running child: {}", e);
        }
        let _ = ctx.reply(&[b"STOP_OK".to_vec()]).await;
        HandlerOutcome::Ok
    }

    async fn event(&mut self, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let mut out = vec![b"EVENT".to_vec()];
        out.extend(args.iter().map(FieldValue::to_raw));
        let _ = ctx.reply(&out).await;
        HandlerOutcome::Ok
    }

    async fn finished(&mut self, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let exit_code = args.first().and_then(FieldValue::as_int).unwrap_or(-1);
        let _ = ctx.reply(&[b"FINISHED".to_vec(), FieldValue::Int(exit_code).to_raw()]).await;
        HandlerOutcome::Ok
    }

    async fn quit(&mut self, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        ctx.close();
        HandlerOutcome::Fail
    }

    async fn error_action(&mut self, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        let message = args.first().and_then(FieldValue::as_str).unwrap_or("internal error").to_string();
        self.reply_error(ctx, message).await;
        HandlerOutcome::Ok
    }
}

#[async_trait]
impl ProtocolHandlers for AppControlServer {
    async fn on_message(&mut self, handler: &str, msg: &Inbound, ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        match handler {
            "howdy" => self.howdy(msg, ctx).await,
            "load" => self.load(msg, ctx).await,
            "chunk" => self.chunk(msg, ctx).await,
            "run" => self.run(msg, ctx).await,
            "stop" => self.stop(msg, ctx).await,
            "quit" => self.quit(ctx).await,
            other => {
                warn!("no handler named '{}'", other);
                HandlerOutcome::Fail
            }
        }
    }

    async fn on_action(&mut self, handler: &str, args: &[FieldValue], ctx: &mut EngineCtx<'_, '_>) -> HandlerOutcome {
        match handler {
            "event" => self.event(args, ctx).await,
            "finished" => self.finished(args, ctx).await,
            "error_action" => self.error_action(args, ctx).await,
            other => {
                warn!("no action handler named '{}'", other);
                HandlerOutcome::Fail
            }
        }
    }

    async fn on_timeout(&mut self, handler: &str, ctx: &mut EngineCtx<'_, '_>) {
        if handler == "load_timeout" {
            self.load_timeout(ctx).await;
        }
    }

    async fn on_keepalive_lost(&mut self, _handler: Option<&str>, _ctx: &mut EngineCtx<'_, '_>) {
        // The server side of this protocol never declares a keepalive block
        // (spec §4.7); only the client times its peer out this way.
    }
}

fn states(load_timeout: Duration) -> Vec<StateDef> {
    vec![
        StateDef {
            name: "READY",
            messages: vec![MessageEntry { name: "LOAD", handler: "load", next_state: SAME_STATE }],
            ..Default::default()
        },
        StateDef {
            name: "LOADING",
            messages: vec![MessageEntry { name: "CHUNK", handler: "chunk", next_state: SAME_STATE }],
            timeout: Some(TimeoutEntry { duration: load_timeout, handler: "load_timeout", next_state: "READY" }),
            ..Default::default()
        },
        StateDef {
            name: "LOADED",
            messages: vec![MessageEntry { name: "RUN", handler: "run", next_state: "RUNNING" }],
            ..Default::default()
        },
        StateDef {
            name: "RUNNING",
            messages: vec![MessageEntry { name: "STOP", handler: "stop", next_state: "LOADED" }],
            actions: vec![
                ActionEntry { name: "event", handler: "event", next_state: SAME_STATE, error_state: None },
                ActionEntry { name: "finished", handler: "finished", next_state: "LOADED", error_state: None },
            ],
            ..Default::default()
        },
        StateDef {
            name: OVERLAY_STATE,
            messages: vec![
                MessageEntry { name: "HOWDY", handler: "howdy", next_state: SAME_STATE },
                MessageEntry { name: "QUIT", handler: "quit", next_state: SAME_STATE },
            ],
            actions: vec![ActionEntry { name: "error", handler: "error_action", next_state: "READY", error_state: None }],
            ..Default::default()
        },
    ]
}

/// Accepts connections on `env`'s configured port range and runs one fresh
/// protocol engine per client, forwarding its supervisor's output and exit
/// status back onto the same reactor as `event`/`finished` actions.
pub async fn serve(
    env: Env,
    host: &str,
    port_range: std::ops::RangeInclusive<u16>,
    load_timeout: Duration,
    publisher: Option<Publisher>,
) -> std::io::Result<SocketAddr> {
    let listener = bind_any(host, port_range).await?;
    let local_addr = listener.local_addr()?;
    info!("application-control server listening on {}", local_addr);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            info!("accepted connection from {}", peer);
            let env = env.clone();
            let publisher = publisher.clone();
            tokio::spawn(async move {
                if let Err(e) = run_connection(env, load_timeout, stream, publisher).await {
                    warn!("connection from {} ended: {}", peer, e);
                }
            });
        }
    });

    Ok(local_addr)
}

async fn bind_any(host: &str, port_range: std::ops::RangeInclusive<u16>) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for port in port_range {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrInUse, "port range exhausted")))
}

async fn run_connection(
    env: Env,
    load_timeout: Duration,
    stream: tokio::net::TcpStream,
    publisher: Option<Publisher>,
) -> std::io::Result<()> {
    let bad_header_counter = Arc::new(VitalCounter::new("rx_err_bad_header", "malformed frames dropped before dispatch"));
    let socket = TcpFramedSocket::from_accepted(SIGNATURE, stream, bad_header_counter);
    let address = env.event_proxy_address();
    let (handlers, mut events) = AppControlServer::new(env, load_timeout);

    let mut sockets = std::collections::HashMap::new();
    sockets.insert(1u64, Box::new(socket) as Box<dyn crate::framing::socket::FramedSocket>);

    let engine = ProtocolEngine::new("app-control-server", schema(), states(load_timeout), handlers, Box::new(NullObserver), 1)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let handle = reactor::spawn(sockets, engine);

    forward_supervisor_events(handle.clone(), events);
    spawn_child_event_proxy(handle, address, publisher);

    Ok(())
}

fn forward_supervisor_events(handle: ReactorHandle, mut events: tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SupervisorEvent::Stdout(line) => push_event(&handle, "STDOUT", "", "text", &line),
                SupervisorEvent::Stderr(line) => push_event(&handle, "STDERR", "", "text", &line),
                SupervisorEvent::Finished(code) => {
                    handle.push_action("finished", vec![FieldValue::Int(code as i64)]);
                }
            }
        }
    });
}

fn push_event(handle: &ReactorHandle, event_type: &str, event_name: &str, data_type: &str, data: &str) {
    handle.push_action(
        "event",
        vec![
            FieldValue::Str(event_type.to_string()),
            FieldValue::Str(event_name.to_string()),
            FieldValue::Str(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()),
            FieldValue::Str(data_type.to_string()),
            FieldValue::Str(data.to_string()),
        ],
    );
}

/// Binds this connection's own [`AppEventProxy`] at `address` and relays
/// whatever the running payload's process pushes onto it both to this
/// connection's own peer and (when a fabric [`Publisher`] is configured) to
/// the wider Event Fabric.
fn spawn_child_event_proxy(handle: ReactorHandle, address: String, publisher: Option<Publisher>) {
    let proxy = match AppEventProxy::bind(&address) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!("failed to bind event proxy for '{}': {}", address, e);
            return;
        }
    };
    tokio::spawn(proxy.run(move |record| {
        push_event(&handle, &record.event_type, &record.name, "text", &record.payload.join(" "));
        if let Some(publisher) = &publisher {
            publisher.publish(&record.name, &record.event_type, record.payload.clone());
        }
    }));
}
