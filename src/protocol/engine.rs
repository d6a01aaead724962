//! The running engine: owns the current state, drives the receive and
//! action paths, and runs the keep-alive sub-protocol (spec §4.6).

use super::{KeepAliveEntry, Schema, StateDef, StateObserver, OVERLAY_STATE, SAME_STATE};
use crate::framing::{FieldValue, Inbound, RawFrame};
use crate::reactor::{ReactorCtx, ReactorEvent, ReactorSink, SocketId};
use async_trait::async_trait;
use tracing::{debug, warn};

/// What a message or action handler reports back to the engine.
pub enum HandlerOutcome {
    /// Transition to the entry's statically configured `next_state`.
    Ok,
    /// Do not transition.
    Fail,
    /// Transition to a state chosen by the handler itself rather than the
    /// table entry's static `next_state` — needed where the wire content
    /// determines the destination, such as the client's handshake reply
    /// naming the state the server is already in (spec §4.7 `HI`).
    GoTo(String),
}

/// Implemented by the concrete protocol (the application-control server or
/// client) to supply the behaviour named by each state table entry's
/// `handler` string. Handler names are plain strings rather than function
/// pointers so the same [`StateDef`] table can be a `'static` constant.
#[async_trait]
pub trait ProtocolHandlers: Send {
    async fn on_enter(&mut self, _handler: &str, _engine: &mut EngineCtx<'_, '_>) {}
    async fn on_message(&mut self, handler: &str, msg: &Inbound, engine: &mut EngineCtx<'_, '_>) -> HandlerOutcome;
    async fn on_action(&mut self, handler: &str, args: &[FieldValue], engine: &mut EngineCtx<'_, '_>) -> HandlerOutcome;
    async fn on_timeout(&mut self, handler: &str, engine: &mut EngineCtx<'_, '_>);
    async fn on_keepalive_lost(&mut self, handler: Option<&str>, engine: &mut EngineCtx<'_, '_>);
}

/// Handed to handler callbacks so they can send a reply without the engine
/// exposing its whole internal state.
pub struct EngineCtx<'a, 'b> {
    socket_id: SocketId,
    reply_to: &'a Option<String>,
    current_state: &'a str,
    reactor: &'a mut ReactorCtx<'b>,
}

impl<'a, 'b> EngineCtx<'a, 'b> {
    pub async fn reply(&mut self, fields: &[Vec<u8>]) -> Result<(), crate::error::FrameError> {
        self.reactor.send(self.socket_id, self.reply_to.as_deref(), fields).await
    }

    /// The state the engine was in when this handler was invoked (before
    /// any transition this call might trigger).
    pub fn current_state(&self) -> &str {
        self.current_state
    }

    /// Tears down the owning reactor once the current handler returns (spec
    /// §4.7 `QUIT`).
    pub fn close(&mut self) {
        self.reactor.request_close();
    }

    /// Declares a uniform failure, handled by whichever `error` action entry
    /// is in scope for the state this lands on (spec §4.7 LOADING "fire
    /// `error`").
    pub fn fire_action(&mut self, name: impl Into<String>, args: Vec<FieldValue>) {
        self.reactor.fire_action(name, args);
    }
}

/// Construction args for [`ProtocolEngine`]: `Protocol(name, location,
/// schema, states, state_observer?)` (spec §4.6).
pub struct ProtocolEngine<H: ProtocolHandlers> {
    name: String,
    schema: Schema,
    states: Vec<StateDef>,
    overlay: StateDef,
    current: usize,
    peer_alive: bool,
    reply_to: Option<String>,
    handlers: H,
    observer: Box<dyn StateObserver>,
    socket_id: SocketId,
}

impl<H: ProtocolHandlers> ProtocolEngine<H> {
    /// `states[0]` is the initial state; a state named [`super::OVERLAY_STATE`]
    /// is extracted as the overlay rather than kept in the concrete list.
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        mut states: Vec<StateDef>,
        handlers: H,
        observer: Box<dyn StateObserver>,
        socket_id: SocketId,
    ) -> Result<Self, crate::error::EngineError> {
        let overlay_idx = states.iter().position(|s| s.name == OVERLAY_STATE);
        let overlay = overlay_idx.map(|i| states.remove(i)).unwrap_or_else(|| StateDef::new(OVERLAY_STATE));

        super::validate_states(&states, &schema)?;

        Ok(Self {
            name: name.into(),
            schema,
            states,
            overlay,
            current: 0,
            peer_alive: true,
            reply_to: None,
            handlers,
            observer,
            socket_id,
        })
    }

    pub fn current_state(&self) -> &str {
        self.states[self.current].name
    }

    pub fn peer_alive(&self) -> bool {
        self.peer_alive
    }

    /// Runs the initial state's `on_enter` logic; callers invoke this once
    /// right after registering the engine with a reactor.
    pub async fn enter_initial(&mut self, ctx: &mut ReactorCtx<'_>) {
        self.observer.on_state_enter(self.states[0].name);
        self.run_on_enter(ctx).await;
    }

    async fn run_on_enter(&mut self, ctx: &mut ReactorCtx<'_>) {
        let state = self.states[self.current].clone();
        if let Some(t) = &state.timeout {
            ctx.add_timer(state.name, t.duration);
        }
        if let Some(k) = &state.keepalive {
            self.peer_alive = false;
            ctx.add_timer("keep-alive", k.duration);
            let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
            let _ = engine_ctx.reply(&[b"keep-alive-req".to_vec()]).await;
        }
        if let Some(handler) = state.on_enter {
            let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
            self.handlers.on_enter(handler, &mut engine_ctx).await;
        }
    }

    fn run_on_leave(&mut self, ctx: &mut ReactorCtx<'_>) {
        let state = &self.states[self.current];
        self.observer.on_state_leave(state.name);
        ctx.remove_timer(state.name);
        if state.keepalive.is_some() {
            ctx.remove_timer("keep-alive");
        }
    }

    async fn transition(&mut self, next_state: &str, ctx: &mut ReactorCtx<'_>) {
        if next_state == SAME_STATE {
            return;
        }
        let Some(idx) = self.states.iter().position(|s| s.name == next_state) else {
            warn!("protocol '{}': transition to unknown state '{}'", self.name, next_state);
            return;
        };
        self.run_on_leave(ctx);
        self.current = idx;
        self.observer.on_state_enter(self.states[self.current].name);
        self.run_on_enter(ctx).await;
    }

    async fn handle_message(&mut self, frame: RawFrame, ctx: &mut ReactorCtx<'_>) {
        let Some(header) = frame.header_str().map(str::to_string) else {
            debug!("protocol '{}': dropping frame with non-UTF8 header", self.name);
            return;
        };

        if header == "keep-alive-rep" {
            self.peer_alive = true;
            return;
        }
        if header == "keep-alive-req" {
            let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &frame.address, current_state: self.states[self.current].name, reactor: ctx };
            let _ = engine_ctx.reply(&[b"keep-alive-rep".to_vec()]).await;
            return;
        }

        let Some(descriptors) = self.schema.get(header.as_str()) else {
            debug!("protocol '{}': unknown header '{}'", self.name, header);
            return;
        };
        if frame.fields.len() - 1 != descriptors.len() {
            debug!("protocol '{}': field count mismatch for '{}'", self.name, header);
            return;
        }
        let mut fields = Vec::with_capacity(descriptors.len());
        for (i, (raw, desc)) in frame.fields[1..].iter().zip(descriptors.iter()).enumerate() {
            match FieldValue::cast(raw, desc.ty, i) {
                Ok(v) => fields.push(v),
                Err(e) => {
                    debug!("protocol '{}': {}", self.name, e);
                    return;
                }
            }
        }

        self.reply_to = frame.address.clone();
        let inbound = Inbound { address: frame.address, header: header.clone(), fields };

        let entry = self.states[self.current]
            .messages
            .iter()
            .chain(self.overlay.messages.iter())
            .find(|m| m.name == header)
            .cloned();

        let Some(entry) = entry else {
            debug!("protocol '{}': '{}' invalid in state '{}'", self.name, header, self.current_state());
            return;
        };

        let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
        let outcome = self.handlers.on_message(entry.handler, &inbound, &mut engine_ctx).await;
        match outcome {
            HandlerOutcome::Ok => self.transition(entry.next_state, ctx).await,
            HandlerOutcome::Fail => {}
            HandlerOutcome::GoTo(state) => self.transition(&state, ctx).await,
        }
    }

    async fn handle_action(&mut self, name: String, args: Vec<FieldValue>, ctx: &mut ReactorCtx<'_>) {
        let entry = self.states[self.current]
            .actions
            .iter()
            .chain(self.overlay.actions.iter())
            .find(|a| a.name == name)
            .cloned();

        let Some(entry) = entry else {
            debug!("protocol '{}': action '{}' invalid in state '{}'", self.name, name, self.current_state());
            return;
        };

        let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
        let outcome = self.handlers.on_action(entry.handler, &args, &mut engine_ctx).await;
        match outcome {
            HandlerOutcome::Ok => self.transition(entry.next_state, ctx).await,
            HandlerOutcome::Fail => {
                if let Some(error_state) = entry.error_state {
                    self.transition(error_state, ctx).await;
                }
            }
            HandlerOutcome::GoTo(state) => self.transition(&state, ctx).await,
        }
    }

    async fn handle_timer(&mut self, name: String, ctx: &mut ReactorCtx<'_>) {
        if name == "keep-alive" {
            let Some(keepalive) = self.states[self.current].keepalive.clone() else { return };
            if self.peer_alive {
                self.peer_alive = false;
                ctx.add_timer("keep-alive", keepalive.duration);
                let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
                let _ = engine_ctx.reply(&[b"keep-alive-req".to_vec()]).await;
            } else {
                self.keepalive_lost(&keepalive, ctx).await;
            }
            return;
        }

        if name == self.current_state() {
            let Some(timeout) = self.states[self.current].timeout.clone() else { return };
            let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
            self.handlers.on_timeout(timeout.handler, &mut engine_ctx).await;
            self.transition(timeout.next_state, ctx).await;
        }
        // A firing whose name no longer matches the current state arrived
        // after the state was left; the generation check in the reactor
        // already filters most of these, this is the residual guard.
    }

    async fn keepalive_lost(&mut self, keepalive: &KeepAliveEntry, ctx: &mut ReactorCtx<'_>) {
        let mut engine_ctx = EngineCtx { socket_id: self.socket_id, reply_to: &self.reply_to, current_state: self.states[self.current].name, reactor: ctx };
        self.handlers.on_keepalive_lost(keepalive.handler, &mut engine_ctx).await;
        self.transition(keepalive.next_state, ctx).await;
    }
}

#[async_trait]
impl<H: ProtocolHandlers> ReactorSink for ProtocolEngine<H> {
    async fn on_start(&mut self, ctx: &mut ReactorCtx<'_>) {
        self.enter_initial(ctx).await;
    }

    async fn handle(&mut self, event: ReactorEvent, ctx: &mut ReactorCtx<'_>) {
        match event {
            ReactorEvent::Message { frame, .. } => self.handle_message(frame, ctx).await,
            ReactorEvent::Action { name, args } => self.handle_action(name, args, ctx).await,
            ReactorEvent::Timer { name } => self.handle_timer(name, ctx).await,
            ReactorEvent::SocketClosed { .. } => ctx.request_close(),
        }
    }
}
