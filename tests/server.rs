//! Wire-level tests against a real TCP server instance.

use ded_monitor::config::Config;
use ded_monitor::monitor::Monitor;
use ded_monitor::net::{Server, ServerHandle};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn next_json(&mut self) -> Value {
        let line = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Next push event, skipping command replies.
    async fn next_event(&mut self) -> Value {
        loop {
            let value = self.next_json().await;
            if value.get("type").is_some() {
                return value;
            }
        }
    }

    /// Send a command and wait for its reply, skipping interleaved events.
    async fn request(&mut self, body: &str) -> Value {
        self.writer.write_all(body.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        loop {
            let value = self.next_json().await;
            if value.get("ok").is_some() {
                return value;
            }
        }
    }
}

async fn start_server(dir: &std::path::Path) -> (Arc<Monitor>, ServerHandle) {
    let mut config = Config::default();
    config.storage.base_dir = dir.to_path_buf();
    config.server.bind = "127.0.0.1:0".into();
    config.server.ping_interval = Duration::from_millis(100);
    config.acquisition.tick_period = Duration::from_millis(10);
    config.instruments.camera.enabled = false;
    config.instruments.cnc.enabled = false;
    config.instruments.laser.enabled = true;
    config.instruments.laser.rate_hz = 200.0;
    config.instruments.pyrometer.enabled = false;
    config.instruments.aux_camera.enabled = false;

    let monitor = Monitor::new(config);
    let server = Server::spawn(monitor.clone(), "127.0.0.1:0").await.unwrap();
    (monitor, server)
}

#[tokio::test]
async fn ack_is_the_first_line_on_every_connection() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;

    let mut a = Client::connect(&server).await;
    let mut b = Client::connect(&server).await;
    let ack_a = a.next_json().await;
    let ack_b = b.next_json().await;

    assert_eq!(ack_a["type"], "connection");
    assert_eq!(ack_b["type"], "connection");
    assert_ne!(ack_a["client_id"], ack_b["client_id"]);

    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn status_and_lifecycle_over_the_wire() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;
    let mut client = Client::connect(&server).await;
    client.next_json().await; // ack

    let reply = client.request(r#"{"op":"status"}"#).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["acquisition"], "idle");

    let reply = client.request(r#"{"op":"start_acquisition"}"#).await;
    assert_eq!(reply["ok"], true);
    // Double start is rejected, not fatal.
    let reply = client.request(r#"{"op":"start_acquisition"}"#).await;
    assert_eq!(reply["ok"], false);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let reply = client.request(r#"{"op":"latest"}"#).await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["tick"].is_u64());
    assert!(reply["data"]["availability"]["laser"].is_boolean());

    let reply = client.request(r#"{"op":"history","limit":3}"#).await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"].as_array().unwrap().len() <= 3);

    let reply = client.request(r#"{"op":"stop_acquisition"}"#).await;
    assert_eq!(reply["ok"], true);

    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn subscribers_receive_data_and_ping_events() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;
    let mut client = Client::connect(&server).await;
    client.next_json().await; // ack

    monitor.start_acquisition().await.unwrap();

    let mut saw_data = false;
    let mut saw_ping = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while (!saw_data || !saw_ping) && tokio::time::Instant::now() < deadline {
        let event = tokio::time::timeout(Duration::from_secs(1), client.next_event())
            .await
            .unwrap();
        match event["type"].as_str() {
            Some("data") => {
                assert!(event["record"]["tick"].is_u64());
                saw_data = true;
            }
            Some("ping") => saw_ping = true,
            _ => {}
        }
    }
    assert!(saw_data && saw_ping);

    monitor.stop_acquisition().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn malformed_commands_get_error_replies_and_keep_the_connection() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;
    let mut client = Client::connect(&server).await;
    client.next_json().await; // ack

    let reply = client.request(r#"{"op":"reboot"}"#).await;
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().contains("bad request"));

    let reply = client.request("not json at all").await;
    assert_eq!(reply["ok"], false);

    // The connection still works afterwards.
    let reply = client.request(r#"{"op":"status"}"#).await;
    assert_eq!(reply["ok"], true);

    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn one_disconnecting_client_does_not_break_another() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;

    let mut keeper = Client::connect(&server).await;
    keeper.next_json().await; // ack
    let goner = Client::connect(&server).await;
    drop(goner);

    monitor.start_acquisition().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), keeper.next_event())
        .await
        .unwrap();
    assert!(event["type"].is_string());

    let reply = keeper.request(r#"{"op":"status"}"#).await;
    assert_eq!(reply["ok"], true);

    monitor.stop_acquisition().await.unwrap();
    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn saving_commands_round_trip_over_the_wire() {
    let tmp = tempfile::tempdir().unwrap();
    let (monitor, server) = start_server(tmp.path()).await;
    let mut client = Client::connect(&server).await;
    client.next_json().await; // ack

    client.request(r#"{"op":"start_acquisition"}"#).await;
    let reply = client
        .request(r#"{"op":"start_saving","name":"wire_run"}"#)
        .await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["folder"]
        .as_str()
        .unwrap()
        .contains("wire_run_"));

    let reply = client.request(r#"{"op":"save_status"}"#).await;
    assert_eq!(reply["data"]["saving"], true);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let reply = client.request(r#"{"op":"stop_saving"}"#).await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["rows"].as_u64().unwrap() >= 1);

    let reply = client.request(r#"{"op":"stop_saving"}"#).await;
    assert_eq!(reply["ok"], false);

    let reply = client
        .request(r#"{"op":"begin_capture","id":"wire_hold"}"#)
        .await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["id"], "wire_hold");
    assert_eq!(reply["data"]["state"], "active");

    tokio::time::sleep(Duration::from_millis(60)).await;
    let reply = client
        .request(r#"{"op":"promote_capture","name":"wire_kept"}"#)
        .await;
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["rows"].as_u64().unwrap() >= 1);

    client.request(r#"{"op":"stop_acquisition"}"#).await;
    server.shutdown(Duration::from_secs(1)).await;
    monitor.shutdown().await;
}
