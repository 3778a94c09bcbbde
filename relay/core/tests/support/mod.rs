//! Shared helpers for relay integration tests
//!
//! `FakeAgent` is a minimal HTTP/1.1 server on a loopback port. It answers
//! `POST /research/stream` with a scripted, close-delimited body and
//! `GET /health` with 200, and records every JSON request body it receives.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_core::{
    ConnectionSettings, PersistenceCoordinator, RelayContext, RelaySettings, ResearchAgent,
    ServerMessage, StreamRelay, TurnStore,
};

/// How the fake agent answers a research request
#[derive(Clone, Debug)]
pub enum Reply {
    /// 200 with these writes, each after its delay
    Stream(Vec<(Duration, Vec<u8>)>),
    /// A bare status with a short body
    Status(u16),
    /// A status whose large body starts only after `delay`
    SlowStatus(u16, Duration),
}

pub struct FakeAgent {
    pub url: String,
    bodies: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&bodies);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let reply = reply.clone();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move { serve(socket, reply, recorded).await });
            }
        });

        Self { url, bodies, task }
    }

    /// JSON bodies of the research requests received so far
    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().clone()
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, reply: Reply, recorded: Arc<Mutex<Vec<Value>>>) {
    let _ = socket.set_nodelay(true);
    let Some((path, body)) = read_request(&mut socket).await else {
        return;
    };

    if path == "/health" {
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await;
        return;
    }

    if let Ok(json) = serde_json::from_slice(&body) {
        recorded.lock().push(json);
    }

    match reply {
        Reply::Status(status) => {
            let response = format!(
                "HTTP/1.1 {status} Error\r\nContent-Length: 5\r\nConnection: close\r\n\r\nerror"
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        Reply::SlowStatus(status, delay) => {
            let head = format!(
                "HTTP/1.1 {status} Error\r\nContent-Length: 65536\r\nConnection: close\r\n\r\n"
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(&vec![b'x'; 65536]).await;
        }
        Reply::Stream(writes) => {
            let head = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            if socket.write_all(head).await.is_err() {
                return;
            }
            for (delay, bytes) in writes {
                tokio::time::sleep(delay).await;
                if socket.write_all(&bytes).await.is_err() || socket.flush().await.is_err() {
                    return;
                }
            }
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1)?.to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some((path, buf[header_end..].to_vec()))
}

/// `data: ` lines for each JSON payload
pub fn sse_body(frames: &[&str]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|json| format!("data: {json}\n\n").into_bytes())
        .collect()
}

/// Cut `body` at each offset in `cuts` (ascending)
pub fn split_at(body: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        pieces.push(body[start..cut].to_vec());
        start = cut;
    }
    pieces.push(body[start..].to_vec());
    pieces
}

pub fn relay_context(
    agent: Arc<dyn ResearchAgent>,
    store: Arc<dyn TurnStore>,
    stall_timeout: Duration,
) -> RelayContext {
    RelayContext {
        relay: Arc::new(StreamRelay::new(
            agent,
            RelaySettings {
                stall_timeout,
                max_consecutive_protocol_errors: 3,
            },
        )),
        persistence: PersistenceCoordinator::new(store),
        settings: ConnectionSettings::default(),
    }
}

/// Everything currently queued for the client
pub fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
