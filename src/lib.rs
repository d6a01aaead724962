//! # app-control-core
//!
//! The application-control core of a distributed strategy-execution
//! platform: a generic state-machine protocol engine, the concrete
//! app-control protocol built on it (handshake, chunked MD5-verified
//! payload transfer, process supervision, event streaming), and the
//! discovery/event-fabric fan-out that lets independently started
//! components find each other on a LAN.

pub mod appcontrol;
pub mod cli;
pub mod discovery;
pub mod env;
pub mod error;
pub mod fabric;
pub mod framing;
pub mod logging;
pub mod protocol;
pub mod reactor;
pub mod supervisor;
pub mod vitals;

pub use cli::{Args, Config};
pub use env::Env;
pub use error::{AppControlError, EngineError, FrameError, SupervisorError};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values (spec §6's configuration table).
pub mod defaults {
    use std::ops::RangeInclusive;
    use std::time::Duration;

    /// Bytes per `CHUNK` data field.
    pub const CHUNK_SIZE: usize = 15000;

    /// Max outstanding chunks before the sender must wait for `CHUNK_OK`.
    pub const WINDOW_SIZE: usize = 10;

    /// Discovery beacon emit interval.
    pub const BEACON_PERIOD: Duration = Duration::from_secs(10);

    /// Discovery stale-entry threshold.
    pub const AGE_OUT: Duration = Duration::from_secs(40);

    /// Client `INIT` state timeout.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Server `LOADING` state timeout.
    pub const LOAD_TIMEOUT: Duration = Duration::from_secs(60);

    /// Keep-alive interval.
    pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

    /// Control server bind range.
    pub const SERVER_PORT_RANGE: RangeInclusive<u16> = 8100..=8500;

    /// Event publisher bind range.
    pub const EVENT_PORT_RANGE: RangeInclusive<u16> = 7000..=8000;
}
