//! Schema-validated, state-driven message/action dispatcher with timeouts
//! and keep-alive (spec §4.6) — the generic engine the application-control
//! protocol is built on top of.

pub mod engine;

use crate::framing::{FieldDescriptor, FieldType};
use std::collections::HashMap;
use std::time::Duration;

/// `next_state`/`error_state` sentinel meaning "remain in the current
/// state" (spec §3).
pub const SAME_STATE: &str = "-";

/// The all-states overlay name, consulted after the concrete current state
/// for both messages and actions (spec §3, GLOSSARY "Overlay state").
pub const OVERLAY_STATE: &str = "*";

pub type Schema = HashMap<&'static str, Vec<FieldDescriptor>>;

pub fn schema_entry(name: &'static str, fields: &[(&'static str, FieldType)]) -> (&'static str, Vec<FieldDescriptor>) {
    (name, fields.iter().map(|&(n, t)| FieldDescriptor { name: n, ty: t }).collect())
}

/// `{name, handler, next_state}` (spec §3).
#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub name: &'static str,
    pub handler: &'static str,
    pub next_state: &'static str,
}

/// `{name, handler, next_state, error_state?}` (spec §3).
#[derive(Debug, Clone)]
pub struct ActionEntry {
    pub name: &'static str,
    pub handler: &'static str,
    pub next_state: &'static str,
    pub error_state: Option<&'static str>,
}

/// `{duration, handler, next_state}` (spec §3).
#[derive(Debug, Clone)]
pub struct TimeoutEntry {
    pub duration: Duration,
    pub handler: &'static str,
    pub next_state: &'static str,
}

/// `{duration, handler?, next_state}` (spec §3).
#[derive(Debug, Clone)]
pub struct KeepAliveEntry {
    pub duration: Duration,
    pub handler: Option<&'static str>,
    pub next_state: &'static str,
}

/// `{name, actions[], messages[], timeout?, keepalive?, on_enter?}` (spec §3,
/// `on_enter` per §11 supplement — behaviour run once on entry, independent
/// of the timeout/keep-alive timers, e.g. the client's `INIT` state sending
/// `HOWDY`).
#[derive(Debug, Clone, Default)]
pub struct StateDef {
    pub name: &'static str,
    pub actions: Vec<ActionEntry>,
    pub messages: Vec<MessageEntry>,
    pub timeout: Option<TimeoutEntry>,
    pub keepalive: Option<KeepAliveEntry>,
    pub on_enter: Option<&'static str>,
}

impl StateDef {
    pub fn new(name: &'static str) -> Self {
        Self { name, ..Default::default() }
    }
}

/// Validates a state list against its schema (spec §4.6 "Construction"):
/// every `next_state`/`error_state` must name a known state or `-`, and
/// every message name must exist in `schema`. Violations are
/// construction-time bugs, never runtime faults.
pub fn validate_states(states: &[StateDef], schema: &Schema) -> Result<(), crate::error::EngineError> {
    use crate::error::EngineError;

    if states.is_empty() {
        return Err(EngineError::EmptyStateList);
    }

    let mut seen = std::collections::HashSet::new();
    for state in states {
        if !seen.insert(state.name) {
            return Err(EngineError::DuplicateState(state.name.to_string()));
        }
    }
    let known = |name: &str| name == SAME_STATE || states.iter().any(|s| s.name == name);

    for state in states {
        for msg in &state.messages {
            if !known(msg.next_state) {
                return Err(EngineError::UnknownNextState(state.name.to_string(), msg.next_state.to_string()));
            }
            if !schema.contains_key(msg.name) && msg.name != "keep-alive-req" && msg.name != "keep-alive-rep" {
                return Err(EngineError::UnknownMessage(state.name.to_string(), msg.name.to_string()));
            }
        }
        for action in &state.actions {
            if !known(action.next_state) {
                return Err(EngineError::UnknownNextState(state.name.to_string(), action.next_state.to_string()));
            }
            if let Some(err_state) = action.error_state {
                if !known(err_state) {
                    return Err(EngineError::UnknownErrorState(state.name.to_string(), err_state.to_string()));
                }
            }
        }
        if let Some(t) = &state.timeout {
            if !known(t.next_state) {
                return Err(EngineError::UnknownNextState(state.name.to_string(), t.next_state.to_string()));
            }
        }
        if let Some(k) = &state.keepalive {
            if !known(k.next_state) {
                return Err(EngineError::UnknownNextState(state.name.to_string(), k.next_state.to_string()));
            }
        }
    }
    Ok(())
}

/// Notified on every state transition; lets owners (tests, CLI logging)
/// observe the engine without it hard-coding a logging dependency (spec
/// §11 supplement to §4.6's `state_observer?`).
pub trait StateObserver: Send {
    fn on_state_enter(&mut self, state: &str);
    fn on_state_leave(&mut self, state: &str);
}

pub struct NullObserver;
impl StateObserver for NullObserver {
    fn on_state_enter(&mut self, _state: &str) {}
    fn on_state_leave(&mut self, _state: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FieldType;

    fn schema() -> Schema {
        HashMap::from([schema_entry("HOWDY", &[("user", FieldType::Str)])])
    }

    #[test]
    fn validate_rejects_unknown_next_state() {
        let states = vec![StateDef {
            name: "READY",
            messages: vec![MessageEntry { name: "HOWDY", handler: "h", next_state: "NOWHERE" }],
            ..Default::default()
        }];
        assert!(validate_states(&states, &schema()).is_err());
    }

    #[test]
    fn validate_rejects_message_outside_schema() {
        let states = vec![StateDef {
            name: "READY",
            messages: vec![MessageEntry { name: "BOGUS", handler: "h", next_state: SAME_STATE }],
            ..Default::default()
        }];
        assert!(validate_states(&states, &schema()).is_err());
    }

    #[test]
    fn validate_accepts_same_state_sentinel() {
        let states = vec![StateDef {
            name: "READY",
            messages: vec![MessageEntry { name: "HOWDY", handler: "h", next_state: SAME_STATE }],
            ..Default::default()
        }];
        assert!(validate_states(&states, &schema()).is_ok());
    }
}
