//! In-process stand-in for the Scenic side of the socket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scenic_bridge::{BridgeConfig, Endpoint};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("scenic_bridge=debug")
        .with_test_writer()
        .try_init();
}

/// What the mock does with one structured request.
pub enum Reply {
    /// Send this JSON back with the request's `id` attached.
    Json(Value),
    /// Send this exact line back, untouched.
    Raw(String),
    /// Say nothing.
    Silent,
    /// Drop the connection.
    Hangup,
}

pub struct MockScenic {
    pub endpoint: Endpoint,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockScenic {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let (listener, endpoint) = bind().await;
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let responder = Arc::new(responder);

        let handle = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let responder = responder.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let (read_half, mut write_half) = stream.into_split();
                        let mut lines = BufReader::new(read_half).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            requests.fetch_add(1, Ordering::SeqCst);
                            if line == "hello" {
                                let _ = write_half
                                    .write_all(b"{\"greeting\":\"hello from mock\"}\n")
                                    .await;
                                continue;
                            }
                            let request: Value =
                                serde_json::from_str(&line).unwrap_or(Value::Null);
                            let out = match responder(&request) {
                                Reply::Json(mut reply) => {
                                    if let (Some(id), Value::Object(map)) =
                                        (request.get("id"), &mut reply)
                                    {
                                        map.insert("id".to_string(), id.clone());
                                    }
                                    format!("{reply}\n")
                                }
                                Reply::Raw(raw) => format!("{raw}\n"),
                                Reply::Silent => continue,
                                Reply::Hangup => return,
                            };
                            if write_half.write_all(out.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    });
                }
            })
        };

        Self {
            endpoint,
            connections,
            requests,
            handle,
        }
    }

    /// Replies `{"status":"ok"}` to everything.
    pub async fn ok() -> Self {
        Self::start(|_| Reply::Json(json!({ "status": "ok" }))).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockScenic {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn bind() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new("127.0.0.1", port))
}

/// An endpoint nobody listens on.
pub async fn refused_endpoint() -> Endpoint {
    let (listener, endpoint) = bind().await;
    drop(listener);
    endpoint
}

pub fn fast_config(endpoint: Endpoint) -> BridgeConfig {
    BridgeConfig {
        endpoint,
        connect_timeout: Duration::from_secs(1),
        command_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(20),
        ..BridgeConfig::default()
    }
}
