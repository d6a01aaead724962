//! End-to-end scenarios against a real loopback TCP connection, driving
//! `appcontrol::server::serve` and `appcontrol::client::connect_with_tuning`
//! the way two independent processes would.

use app_control_core::appcontrol::client::{self, ClientObserver, ClientTuning};
use app_control_core::appcontrol::server;
use app_control_core::env::Env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
enum ObservedEvent {
    Error(String),
    Ready,
    Loaded(String, String, String),
    Running,
    Finished(i64),
    Stopped,
    Event(String, String, String, String),
}

struct ChannelObserver(mpsc::UnboundedSender<ObservedEvent>);

impl ClientObserver for ChannelObserver {
    fn on_error(&mut self, message: &str) {
        let _ = self.0.send(ObservedEvent::Error(message.to_string()));
    }
    fn on_ready(&mut self) {
        let _ = self.0.send(ObservedEvent::Ready);
    }
    fn on_loaded(&mut self, file_name: &str, md5: &str, label: &str) {
        let _ = self.0.send(ObservedEvent::Loaded(file_name.to_string(), md5.to_string(), label.to_string()));
    }
    fn on_running(&mut self) {
        let _ = self.0.send(ObservedEvent::Running);
    }
    fn on_finished(&mut self, exit_code: i64) {
        let _ = self.0.send(ObservedEvent::Finished(exit_code));
    }
    fn on_stopped(&mut self) {
        let _ = self.0.send(ObservedEvent::Stopped);
    }
    fn on_event(&mut self, _timestamp: &str, event_type: &str, event_name: &str, data_type: &str, data: &str) {
        let _ = self.0.send(ObservedEvent::Event(event_type.to_string(), event_name.to_string(), data_type.to_string(), data.to_string()));
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<ObservedEvent>) -> ObservedEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("observer event within 5s")
        .expect("observer channel still open")
}

fn fast_tuning() -> ClientTuning {
    ClientTuning {
        chunk_size: 4096,
        window_size: 4,
        handshake_timeout: Duration::from_millis(300),
        load_timeout: Duration::from_secs(5),
        keepalive_period: Duration::from_millis(200),
    }
}

/// Scenario: happy-path load/run/stop/quit (spec §8, scenario 1).
#[tokio::test]
async fn happy_path_load_run_stop_quit() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    let payload = vec![7u8; 42_000];
    tokio::fs::write(&payload_path, &payload).await.unwrap();

    let server_env = Env::new("sysadmin", "strategy1", "server");
    let addr = server::serve(server_env, "127.0.0.1", 18100..=18101, Duration::from_secs(5), None)
        .await
        .unwrap();

    let client_env = Env::new("sysadmin", "strategy1", "client");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client::connect_with_tuning(client_env, "127.0.0.1", addr.port(), fast_tuning(), Box::new(ChannelObserver(tx)))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, ObservedEvent::Ready);

    let file_name = payload_path.to_str().unwrap().to_string();
    handle.push_action("start_loading", vec![app_control_core::framing::FieldValue::Str(file_name.clone()), app_control_core::framing::FieldValue::Str("v1".into())]);

    match recv(&mut rx).await {
        ObservedEvent::Loaded(name, _md5, label) => {
            assert_eq!(name, file_name);
            assert_eq!(label, "v1");
        }
        other => panic!("expected Loaded, got {:?}", other),
    }

    handle.push_action("run", vec![app_control_core::framing::FieldValue::Str("true".into())]);
    assert_eq!(recv(&mut rx).await, ObservedEvent::Running);

    // Simulate the now-running payload's process connecting to its event
    // proxy socket and pushing progress lines (spec §4.8 "Event proxying")
    // exactly the way an externally spawned child would, over a real Unix
    // domain socket rather than any in-process shortcut.
    let address = format!("{}:{}", "sysadmin", "strategy1");
    let socket_path = app_control_core::supervisor::event_proxy_socket_path(&address);
    let mut attempts = 0;
    let mut child_stream = loop {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(stream) => break stream,
            Err(_) if attempts < 50 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("failed to connect to event proxy socket: {}", e),
        }
    };

    let record_50 = app_control_core::fabric::EventRecord {
        event_type: "USER".into(),
        name: "progress".into(),
        timestamp_ns: 1,
        user: "sysadmin".into(),
        application: "strategy1".into(),
        payload: vec!["50%".into()],
    };
    let record_100 = app_control_core::fabric::EventRecord {
        event_type: "USER".into(),
        name: "progress".into(),
        timestamp_ns: 2,
        user: "sysadmin".into(),
        application: "strategy1".into(),
        payload: vec!["100%".into()],
    };
    use tokio::io::AsyncWriteExt;
    child_stream.write_all(format!("{}\n", record_50.to_line()).as_bytes()).await.unwrap();
    child_stream.write_all(format!("{}\n", record_100.to_line()).as_bytes()).await.unwrap();

    match recv(&mut rx).await {
        ObservedEvent::Event(event_type, name, data_type, data) => {
            assert_eq!(event_type, "USER");
            assert_eq!(name, "progress");
            assert_eq!(data_type, "text");
            assert_eq!(data, "50%");
        }
        other => panic!("expected 50% progress event, got {:?}", other),
    }
    match recv(&mut rx).await {
        ObservedEvent::Event(_, _, _, data) => assert_eq!(data, "100%"),
        other => panic!("expected 100% progress event, got {:?}", other),
    }

    handle.push_action("stop", vec![]);
    assert_eq!(recv(&mut rx).await, ObservedEvent::Stopped);

    handle.push_action("quit", vec![]);
}

/// Scenario: MD5 mismatch after a full chunk stream (spec §8, scenario 2).
/// Drives the wire directly with a deliberately wrong digest, since a real
/// client always recomputes and sends the correct one.
#[tokio::test]
async fn md5_mismatch_yields_single_error() {
    use app_control_core::framing::socket::{FramedSocket, TcpFramedSocket};
    use app_control_core::vitals::VitalCounter;

    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    let payload = vec![1u8; 20_000];
    tokio::fs::write(&payload_path, &payload).await.unwrap();

    let server_env = Env::new("sysadmin", "strategy1", "server");
    let addr = server::serve(server_env, "127.0.0.1", 18102..=18103, Duration::from_secs(5), None)
        .await
        .unwrap();

    let counter = Arc::new(VitalCounter::new("rx_err_bad_header", "test"));
    let mut socket = TcpFramedSocket::connect("APPCTRL", "127.0.0.1", addr.port(), counter).await.unwrap();
    socket
        .send(None, &[b"HOWDY".to_vec(), b"sysadmin".to_vec(), b"1".to_vec(), b"0".to_vec()])
        .await
        .unwrap();
    let hi = socket.recv().await.unwrap();
    assert_eq!(hi.header_str(), Some("HI"));

    let bogus_md5 = "a".repeat(32);
    socket
        .send(None, &[b"LOAD".to_vec(), payload_path.to_str().unwrap().as_bytes().to_vec(), bogus_md5.into_bytes(), b"v1".to_vec()])
        .await
        .unwrap();
    let load_ready = socket.recv().await.unwrap();
    assert_eq!(load_ready.header_str(), Some("LOAD_READY"));

    socket.send(None, &[b"CHUNK".to_vec(), b"1".to_vec(), payload]).await.unwrap();

    let reply = socket.recv().await.unwrap();
    assert_eq!(reply.header_str(), Some("ERROR"));
    let message = std::str::from_utf8(&reply.fields[1]).unwrap();
    assert!(message.contains("does not match md5sum"), "unexpected message: {message}");
}

/// Scenario: cache hit skips the chunk stream entirely (spec §8, scenario 3).
#[tokio::test]
async fn cache_hit_skips_chunking() {
    let dir = tempfile::tempdir().unwrap();
    let payload_path = dir.path().join("payload.bin");
    tokio::fs::write(&payload_path, vec![9u8; 1000]).await.unwrap();

    let server_env = Env::new("sysadmin", "strategy1", "server");
    let addr = server::serve(server_env, "127.0.0.1", 18104..=18105, Duration::from_secs(5), None)
        .await
        .unwrap();

    let client_env = Env::new("sysadmin", "strategy1", "client");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client::connect_with_tuning(client_env.clone(), "127.0.0.1", addr.port(), fast_tuning(), Box::new(ChannelObserver(tx)))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, ObservedEvent::Ready);

    let file_name = payload_path.to_str().unwrap().to_string();
    handle.push_action("start_loading", vec![app_control_core::framing::FieldValue::Str(file_name.clone()), app_control_core::framing::FieldValue::Str("v1".into())]);
    assert!(matches!(recv(&mut rx).await, ObservedEvent::Loaded(..)));

    // The same server already holds this exact (file_name, md5): a second
    // client loading it should reach LOADED without any CHUNK exchange.
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let handle2 = client::connect_with_tuning(client_env, "127.0.0.1", addr.port(), fast_tuning(), Box::new(ChannelObserver(tx2)))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx2).await, ObservedEvent::Ready);
    handle2.push_action("start_loading", vec![app_control_core::framing::FieldValue::Str(file_name), app_control_core::framing::FieldValue::Str("v1".into())]);
    let second_start = tokio::time::Instant::now();
    assert!(matches!(recv(&mut rx2).await, ObservedEvent::Loaded(..)));
    assert!(second_start.elapsed() < Duration::from_millis(500), "cache hit should not require a full chunk round-trip");
}

/// Scenario: handshake timeout when no server is listening (spec §8,
/// scenario 4).
#[tokio::test]
async fn handshake_timeout_without_server() {
    // A TCP connect to a closed port fails immediately on most stacks rather
    // than hanging for the handshake timeout, so a listener that accepts
    // but never replies to HOWDY is what actually exercises this path.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = silent.accept().await {
            let _ = stream;
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    });

    let client_env = Env::new("sysadmin", "strategy1", "client");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tuning = ClientTuning { handshake_timeout: Duration::from_millis(200), ..fast_tuning() };
    let _handle = client::connect_with_tuning(client_env, "127.0.0.1", silent_addr.port(), tuning, Box::new(ChannelObserver(tx)))
        .await
        .unwrap();

    match recv(&mut rx).await {
        ObservedEvent::Error(message) => assert!(message.contains("Timeout waiting for HI")),
        other => panic!("expected handshake timeout Error, got {:?}", other),
    }
}

/// Scenario: keep-alive loss when the server goes silent (spec §8, scenario
/// 5). A hand-rolled fake server answers the handshake once, then stops
/// responding entirely (including to keep-alive-req), which is what a
/// killed-but-not-yet-closed peer looks like from the client's side.
#[tokio::test]
async fn keepalive_loss_when_peer_goes_silent() {
    use app_control_core::framing::socket::{FramedSocket, TcpFramedSocket};
    use app_control_core::vitals::VitalCounter;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let counter = Arc::new(VitalCounter::new("rx_err_bad_header", "test"));
        let mut socket = TcpFramedSocket::from_accepted("APPCTRL", stream, counter);
        let howdy = socket.recv().await.unwrap();
        assert_eq!(howdy.header_str(), Some("HOWDY"));
        socket
            .send(
                None,
                &[
                    b"HI".to_vec(),
                    b"1".to_vec(),
                    b"0".to_vec(),
                    b"READY".to_vec(),
                    b"".to_vec(),
                    b"".to_vec(),
                    b"".to_vec(),
                ],
            )
            .await
            .unwrap();
        // Go silent forever: never answer the client's keep-alive-req.
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let client_env = Env::new("sysadmin", "strategy1", "client");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tuning = ClientTuning { keepalive_period: Duration::from_millis(150), ..fast_tuning() };
    let handle = client::connect_with_tuning(client_env, "127.0.0.1", addr.port(), tuning, Box::new(ChannelObserver(tx)))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, ObservedEvent::Ready);

    match recv(&mut rx).await {
        ObservedEvent::Error(message) => assert!(message.contains("keep-alive")),
        other => panic!("expected keep-alive loss Error, got {:?}", other),
    }
    let _ = handle;
}

/// Scenario: user-name rejection (spec §8, scenario 6).
#[tokio::test]
async fn wrong_user_name_is_rejected() {
    let server_env = Env::new("alice", "strategy1", "server");
    let addr = server::serve(server_env, "127.0.0.1", 18108..=18109, Duration::from_secs(5), None)
        .await
        .unwrap();

    let client_env = Env::new("bob", "strategy1", "client");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client::connect_with_tuning(client_env, "127.0.0.1", addr.port(), fast_tuning(), Box::new(ChannelObserver(tx)))
        .await
        .unwrap();

    match recv(&mut rx).await {
        ObservedEvent::Error(message) => assert!(message.contains("Invalid user name")),
        other => panic!("expected Error, got {:?}", other),
    }
    let _ = handle;
}
