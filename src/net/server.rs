//! Line-delimited JSON server.
//!
//! Every connection is a subscriber: it receives the connection
//! acknowledgement, then a stream of push events, and may interleave
//! commands at any time. Commands get exactly one reply line each.

use super::event::Event;
use super::protocol::{Request, Response};
use crate::error::AppResult;
use crate::monitor::Monitor;
use crate::task::TaskHandle;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Running TCP front end.
pub struct ServerHandle {
    addr: std::net::SocketAddr,
    accept: TaskHandle,
    ping: TaskHandle,
}

impl ServerHandle {
    /// Actual bound address (useful when binding port 0).
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Stop the accept loop and the keep-alive ticker.
    pub async fn shutdown(self, grace: std::time::Duration) {
        self.accept.shutdown(grace).await;
        self.ping.shutdown(grace).await;
    }
}

/// TCP front end.
pub struct Server;

impl Server {
    /// Bind `addr` and spawn the accept loop plus the keep-alive ticker.
    pub async fn spawn(monitor: Arc<Monitor>, addr: &str) -> AppResult<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "server listening");

        let ping = spawn_ping(monitor.clone());
        let accept = TaskHandle::spawn("server-accept", move |mut stop| async move {
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "client connected");
                            let monitor = monitor.clone();
                            let stop = stop.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_client(monitor, stream, stop).await {
                                    debug!(%peer, error = %err, "client connection ended");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        });
        Ok(ServerHandle { addr, accept, ping })
    }
}

fn spawn_ping(monitor: Arc<Monitor>) -> TaskHandle {
    let interval = monitor.config().server.ping_interval;
    TaskHandle::spawn("server-ping", move |mut stop| async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = ticker.tick() => {
                    if let Err(err) = monitor.broadcaster().broadcast(&Event::ping()) {
                        warn!(error = %err, "ping broadcast");
                    }
                    monitor.push_status_event().await;
                }
            }
        }
    })
}

async fn serve_client(
    monitor: Arc<Monitor>,
    stream: TcpStream,
    mut stop: crate::task::StopSignal,
) -> AppResult<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = BufWriter::new(write_half);

    let (client_id, mut outgoing) = monitor.broadcaster().subscribe();
    let result = client_loop(
        &monitor,
        client_id,
        &mut lines,
        &mut writer,
        &mut outgoing,
        &mut stop,
    )
    .await;
    monitor.broadcaster().unsubscribe(client_id);
    result
}

async fn client_loop(
    monitor: &Arc<Monitor>,
    client_id: Uuid,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    outgoing: &mut mpsc::Receiver<Arc<String>>,
    stop: &mut crate::task::StopSignal,
) -> AppResult<()> {
    // Acknowledgement goes out before anything else on the connection.
    let ack = serde_json::to_string(&Event::connection(client_id))?;
    write_line(writer, &ack).await?;

    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            event = outgoing.recv() => match event {
                Some(line) => write_line(writer, &line).await?,
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let response = match serde_json::from_str::<Request>(line) {
                        Ok(request) => handle_request(monitor, request).await,
                        Err(err) => Response::err(format!("bad request: {err}")),
                    };
                    write_line(writer, &serde_json::to_string(&response)?).await?;
                }
                None => break,
            },
        }
    }
    Ok(())
}

async fn write_line(
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn handle_request(monitor: &Arc<Monitor>, request: Request) -> Response {
    match request {
        Request::StartAcquisition => reply_empty(monitor.start_acquisition().await),
        Request::StopAcquisition => reply_empty(monitor.stop_acquisition().await),
        Request::StartSaving { name } => match monitor.start_saving(name).await {
            Ok(folder) => Response::ok(json!({ "folder": folder.display().to_string() })),
            Err(err) => Response::err(err.to_string()),
        },
        Request::StopSaving => reply_value(monitor.stop_saving().await),
        Request::BeginCapture { id } => reply_value(monitor.begin_capture(id).await),
        Request::PromoteCapture { name } => reply_value(monitor.promote_capture(name).await),
        Request::CancelCapture => reply_value(monitor.cancel_capture().await),
        Request::CaptureInfo => reply_value(monitor.capture_info().await),
        Request::Latest => match monitor.latest() {
            Some(record) => reply_value(Ok(record)),
            None => Response::err("no data yet"),
        },
        Request::History { limit } => reply_value(Ok(monitor.history(limit))),
        Request::Status => reply_value(Ok(monitor.status().await)),
        Request::SaveStatus => reply_value(monitor.save_status().await),
    }
}

fn reply_empty(result: AppResult<()>) -> Response {
    match result {
        Ok(()) => Response::ok_empty(),
        Err(err) => Response::err(err.to_string()),
    }
}

fn reply_value<T: serde::Serialize>(result: AppResult<T>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(value),
            Err(err) => Response::err(err.to_string()),
        },
        Err(err) => Response::err(err.to_string()),
    }
}
