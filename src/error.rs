//! Error taxonomy for the application-control core.
//!
//! The kinds below mirror the failure categories the system distinguishes at
//! runtime: a bad frame never reaches the engine, a protocol violation never
//! changes state, an application error is surfaced to the remote peer, and a
//! bug aborts the offending component because it cannot arise from a
//! well-formed peer.

use thiserror::Error;

/// Failures in decoding or validating a wire frame (spec §4.1, §7).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame signature mismatch: expected {expected:?}, got {got:?}")]
    BadSignature { expected: String, got: String },

    #[error("frame length prefix does not cover the body")]
    BadLength,

    #[error("frame field count {got} disagrees with schema ({expected})")]
    BadFieldCount { expected: usize, got: usize },

    #[error("field {index} failed to cast to {expected}")]
    CastFailure { index: usize, expected: &'static str },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Construction-time validation failures for a protocol's state table (spec
/// §4.6). These are bugs: they can only originate from a malformed state
/// table baked in by the implementer, never from wire traffic.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state '{0}' references unknown next_state '{1}'")]
    UnknownNextState(String, String),

    #[error("state '{0}' references unknown error_state '{1}'")]
    UnknownErrorState(String, String),

    #[error("state '{0}' lists message '{1}' with no matching schema entry")]
    UnknownMessage(String, String),

    #[error("state list is empty; an engine needs at least one state")]
    EmptyStateList,

    #[error("duplicate state name '{0}'")]
    DuplicateState(String),
}

/// Application-level failures reported to a peer as `ERROR <reason>` (spec
/// §7). These never abort the engine; they drive a state transition.
#[derive(Debug, Error, Clone)]
pub enum AppControlError {
    #[error("Invalid user name specified!")]
    UserMismatch,

    #[error("File does not match md5sum specified!")]
    Md5Mismatch,

    #[error("Timeout waiting for HI message response!")]
    HandshakeTimeout,

    #[error("failed to open payload file: {0}")]
    FileOpen(String),

    #[error("{0}")]
    Other(String),
}

/// Failures owned by the payload supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no child process is currently running")]
    NotRunning,
}
