//! Application-control client: connects to a control server, then drives
//! `load`/`run`/`stop`/`quit` from stdin commands and logs every observed
//! server event.

use app_control_core::appcontrol::client::{self, ClientObserver, ClientTuning};
use app_control_core::cli::{Args, Config};
use app_control_core::env::Env;
use app_control_core::framing::FieldValue;
use app_control_core::logging;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

struct LoggingObserver;

impl ClientObserver for LoggingObserver {
    fn on_error(&mut self, message: &str) {
        error!("server reported an error: {}", message);
    }

    fn on_ready(&mut self) {
        info!("ready, nothing loaded");
    }

    fn on_loaded(&mut self, file_name: &str, md5: &str, label: &str) {
        info!("loaded '{}' ({}) labeled '{}'", file_name, md5, label);
    }

    fn on_running(&mut self) {
        info!("payload running");
    }

    fn on_finished(&mut self, exit_code: i64) {
        info!("payload finished with exit code {}", exit_code);
    }

    fn on_stopped(&mut self) {
        info!("payload stopped");
    }

    fn on_event(&mut self, timestamp: &str, event_type: &str, event_name: &str, data_type: &str, data: &str) {
        info!("[{}] {} {} ({}): {}", timestamp, event_type, event_name, data_type, data);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from(&args);
    let _log_guard = logging::init(&config);

    let Some(port) = config.remote_port else {
        anyhow::bail!("--remote-port is required to connect to a control server");
    };

    let env = Env::new(config.user.clone(), config.application.clone(), "client");
    let tuning = ClientTuning {
        chunk_size: config.chunk_size,
        window_size: config.window_size,
        handshake_timeout: config.handshake_timeout,
        load_timeout: config.load_timeout,
        keepalive_period: config.keepalive_period,
    };
    let handle = client::connect_with_tuning(env, &config.host, port, tuning, Box::new(LoggingObserver)).await?;
    info!("connected to {}:{}", config.host, port);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    println!("commands: load <file> <label> | run <command...> | stop | quit");
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.splitn(2, ' ');
        match parts.next().unwrap_or_default() {
            "load" => {
                let rest = parts.next().unwrap_or_default();
                let mut rest = rest.splitn(2, ' ');
                let file_name = rest.next().unwrap_or_default().to_string();
                let label = rest.next().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    warn!("usage: load <file> <label>");
                    continue;
                }
                handle.push_action("start_loading", vec![FieldValue::Str(file_name), FieldValue::Str(label)]);
            }
            "run" => {
                let command = parts.next().unwrap_or_default().to_string();
                if command.is_empty() {
                    warn!("usage: run <command...>");
                    continue;
                }
                handle.push_action("run", vec![FieldValue::Str(command)]);
            }
            "stop" => handle.push_action("stop", vec![]),
            "quit" => {
                handle.push_action("quit", vec![]);
                break;
            }
            other if other.is_empty() => {}
            other => warn!("unrecognized command '{}'", other),
        }
    }

    Ok(())
}
