//! Application-control server: accepts payload-delivery connections, runs
//! submitted payloads under the supervisor, and (when `--event-port-range`
//! is reachable) fans running payloads' events out onto the Event Fabric.

use app_control_core::appcontrol::server;
use app_control_core::cli::{Args, Config};
use app_control_core::discovery::{DiscoveryServer, UdpBeaconTransport, DEFAULT_DISCOVERY_PORT};
use app_control_core::env::Env;
use app_control_core::fabric::Publisher;
use app_control_core::logging;
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from(&args);
    let _log_guard = logging::init(&config);

    let env = Env::new(config.user.clone(), config.application.clone(), "server");

    let publisher = match bind_publisher(&env, &config).await {
        Ok(publisher) => {
            watch_publisher_ready(publisher.clone());
            Some(publisher)
        }
        Err(e) => {
            error!("event fabric publisher unavailable, running without it: {}", e);
            None
        }
    };

    let local_addr = server::serve(env, &config.host, config.server_port_range.clone(), config.load_timeout, publisher).await?;
    info!("ready on {}", local_addr);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// Polls [`Publisher::is_ready`] and logs once the post-bind discovery
/// grace period has elapsed, so an operator watching the log can tell
/// when it's actually safe to expect events to reach subscribers.
fn watch_publisher_ready(publisher: Publisher) {
    tokio::spawn(async move {
        while !publisher.is_ready() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        info!("event fabric publisher ready");
    });
}

async fn bind_publisher(env: &Env, config: &Config) -> std::io::Result<Publisher> {
    let transport = UdpBeaconTransport::bind(DEFAULT_DISCOVERY_PORT).await?;
    let discovery = DiscoveryServer::start(transport, config.beacon_period);
    Publisher::bind(
        env.user.clone(),
        env.application.clone(),
        &config.host,
        config.event_port_range.clone(),
        config.beacon_period,
        &discovery,
        std::sync::Arc::new(app_control_core::vitals::VitalCounter::new(
            "rx_err_bad_header",
            "malformed frames dropped before dispatch",
        )),
    )
    .await
}
