//! Single-threaded cooperative event loop multiplexing sockets, an internal
//! command pipe, and named timers (spec §4.2).
//!
//! Every externally visible operation enqueues a record on the command pipe
//! and returns immediately; the actual work happens on the reactor's own
//! task, which is the only place that ever decides on a state transition.
//! This mirrors the single-owner-thread model of the original design
//! without needing a dedicated OS thread: a `tokio` task that only ever
//! advances through its own `select!` plays the same role. Each registered
//! socket gets its own dedicated task that owns it exclusively and relays
//! both directions through channels, so the reactor task itself never
//! blocks on I/O.

use crate::framing::socket::FramedSocket;
use crate::framing::RawFrame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub type SocketId = u64;

/// Events a [`ReactorSink`] is asked to handle, in the strict FIFO order
/// they arrived at the command pipe or a registered socket.
pub enum ReactorEvent {
    Message { socket_id: SocketId, frame: RawFrame },
    Action { name: String, args: Vec<crate::framing::FieldValue> },
    Timer { name: String },
    SocketClosed { socket_id: SocketId },
}

/// The user callback surface the reactor drives. Implementations mutate
/// their own state and use `ctx` to send frames, add/remove timers, or
/// close the reactor; they must never block.
#[async_trait]
pub trait ReactorSink: Send {
    /// Runs once, before the first event is dispatched, with its own
    /// context. Protocol engines use this to run the initial state's
    /// `on_enter` logic (spec §4.6 "Initial state").
    async fn on_start(&mut self, _ctx: &mut ReactorCtx<'_>) {}

    async fn handle(&mut self, event: ReactorEvent, ctx: &mut ReactorCtx<'_>);
}

type Outbound = (Option<String>, Vec<Vec<u8>>);

enum Command {
    SocketFrame(SocketId, RawFrame),
    SocketClosed(SocketId),
    Action(String, Vec<crate::framing::FieldValue>),
    TimerFired(String, u64),
    Kill,
}

/// A timer generation guards against a fired-but-superseded timer acting:
/// `add_timer`/`remove_timer` bump the generation for that name, and a
/// `TimerFired` carrying a stale generation is silently dropped. This is
/// how late timer firings that arrive after the owning state has been left
/// are detected without real cancellation of the sleeping task (spec
/// §4.2 "Timers").
#[derive(Default)]
struct TimerTable {
    generations: HashMap<String, u64>,
}

impl TimerTable {
    fn bump(&mut self, name: &str) -> u64 {
        let gen = self.generations.entry(name.to_string()).or_insert(0);
        *gen += 1;
        *gen
    }

    fn current(&self, name: &str) -> u64 {
        *self.generations.get(name).unwrap_or(&0)
    }
}

/// Handle for posting commands into a running reactor from any thread.
/// Every method here enqueues and returns immediately; none of them touch
/// reactor-owned state directly.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReactorHandle {
    pub fn push_action(&self, name: impl Into<String>, args: Vec<crate::framing::FieldValue>) {
        let _ = self.tx.send(Command::Action(name.into(), args));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Command::Kill);
    }
}

/// Context handed to a [`ReactorSink`] while it handles one event. Lets the
/// handler send on a registered socket and manage timers without owning the
/// socket table itself.
pub struct ReactorCtx<'a> {
    writers: &'a HashMap<SocketId, mpsc::Sender<Outbound>>,
    timers: &'a mut TimerTable,
    self_tx: mpsc::UnboundedSender<Command>,
    pub kill_requested: bool,
}

impl<'a> ReactorCtx<'a> {
    /// Queues a send on the socket's dedicated writer task. Returns once
    /// queued, not once written; a full queue indicates sustained
    /// backpressure from that socket's peer.
    pub async fn send(
        &mut self,
        socket_id: SocketId,
        address: Option<&str>,
        fields: &[Vec<u8>],
    ) -> Result<(), crate::error::FrameError> {
        let writer = self
            .writers
            .get(&socket_id)
            .ok_or_else(|| crate::error::FrameError::Malformed("unknown socket id".into()))?;
        writer
            .send((address.map(str::to_string), fields.to_vec()))
            .await
            .map_err(|_| crate::error::FrameError::Malformed("socket writer task gone".into()))
    }

    /// Schedules a one-shot firing after `duration` that posts `Timer
    /// { name }` to the command pipe. A later `add_timer`/`remove_timer`
    /// for the same name invalidates this firing.
    pub fn add_timer(&mut self, name: impl Into<String>, duration: Duration) {
        let name = name.into();
        let generation = self.timers.bump(&name);
        let tx = self.self_tx.clone();
        let timer_name = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(Command::TimerFired(timer_name, generation));
        });
    }

    pub fn remove_timer(&mut self, name: &str) {
        self.timers.bump(name);
    }

    /// Re-enters the command pipe with a self-targeted action, processed as
    /// the next event on this reactor once the current handler returns
    /// (spec §4.7 LOADING "fire `error`"). Lets a handler declare a uniform
    /// failure without duplicating the overlay's own transition logic.
    pub fn fire_action(&mut self, name: impl Into<String>, args: Vec<crate::framing::FieldValue>) {
        let _ = self.self_tx.send(Command::Action(name.into(), args));
    }

    pub fn request_close(&mut self) {
        self.kill_requested = true;
    }
}

/// Drives a single registered socket: relays inbound frames onto the
/// central command pipe and outbound sends queued via [`ReactorCtx::send`]
/// onto the socket itself. Runs until the socket closes or the reactor
/// drops the writer channel.
async fn socket_task(
    id: SocketId,
    mut socket: Box<dyn FramedSocket>,
    mut outbound: mpsc::Receiver<Outbound>,
    command_tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Ok(frame) => {
                        if command_tx.send(Command::SocketFrame(id, frame)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = command_tx.send(Command::SocketClosed(id));
                        break;
                    }
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some((address, fields)) => {
                        if let Err(e) = socket.send(address.as_deref(), &fields).await {
                            tracing::warn!("socket {} send failed: {}", id, e);
                        }
                    }
                    None => break,
                }
            }
        }
    }
    socket.close();
}

/// Spawns the reactor's own task plus one dedicated task per registered
/// socket, and returns a handle to it.
pub fn spawn<S: ReactorSink + 'static>(
    sockets: HashMap<SocketId, Box<dyn FramedSocket>>,
    mut sink: S,
) -> ReactorHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let mut writers = HashMap::new();

    for (id, socket) in sockets {
        let (out_tx, out_rx) = mpsc::channel(64);
        writers.insert(id, out_tx);
        tokio::spawn(socket_task(id, socket, out_rx, tx.clone()));
    }

    let handle_tx = tx.clone();
    tokio::spawn(async move {
        let mut timers = TimerTable::default();
        {
            let mut ctx = ReactorCtx {
                writers: &writers,
                timers: &mut timers,
                self_tx: handle_tx.clone(),
                kill_requested: false,
            };
            sink.on_start(&mut ctx).await;
        }
        loop {
            let Some(cmd) = rx.recv().await else { break };
            let event = match cmd {
                Command::Kill => break,
                Command::SocketFrame(socket_id, frame) => ReactorEvent::Message { socket_id, frame },
                Command::SocketClosed(socket_id) => ReactorEvent::SocketClosed { socket_id },
                Command::Action(name, args) => ReactorEvent::Action { name, args },
                Command::TimerFired(name, generation) => {
                    if timers.current(&name) != generation {
                        continue;
                    }
                    ReactorEvent::Timer { name }
                }
            };
            let mut ctx = ReactorCtx {
                writers: &writers,
                timers: &mut timers,
                self_tx: handle_tx.clone(),
                kill_requested: false,
            };
            sink.handle(event, &mut ctx).await;
            if ctx.kill_requested {
                break;
            }
        }
        // Dropping `writers` here closes every socket task's outbound
        // channel, which in turn makes each `socket_task` exit and close
        // its socket.
    });

    ReactorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::socket::PairFramedSocket;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ReactorSink for RecordingSink {
        async fn handle(&mut self, event: ReactorEvent, ctx: &mut ReactorCtx<'_>) {
            match event {
                ReactorEvent::Message { socket_id, frame } => {
                    self.events.lock().unwrap().push(format!("msg:{:?}", frame.header_str()));
                    let _ = ctx.send(socket_id, None, &[b"ACK".to_vec()]).await;
                }
                ReactorEvent::Timer { name } => {
                    self.events.lock().unwrap().push(format!("timer:{name}"));
                    ctx.request_close();
                }
                ReactorEvent::Action { name, .. } => {
                    self.events.lock().unwrap().push(format!("action:{name}"));
                }
                ReactorEvent::SocketClosed { .. } => {
                    self.events.lock().unwrap().push("closed".to_string());
                }
            }
        }
    }

    #[tokio::test]
    async fn dispatches_message_then_timer_in_order() {
        let (mut outside, inside) = PairFramedSocket::pair(8);
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut sockets: HashMap<SocketId, Box<dyn FramedSocket>> = HashMap::new();
        sockets.insert(1, Box::new(inside));
        let _handle = spawn(sockets, RecordingSink { events: events.clone() });

        outside.send(None, &[b"HOWDY".to_vec()]).await.unwrap();
        let ack = outside.recv().await.unwrap();
        assert_eq!(ack.fields[0], b"ACK");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.lock().unwrap().iter().any(|e| e.starts_with("msg:")));
    }
}
