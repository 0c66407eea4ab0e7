//! A single live TCP connection to the Scenic app and the request/response
//! correlation running on top of it.
//!
//! Each channel owns two tasks: a writer draining an outbound queue of encoded
//! lines and a reader splitting the inbound stream into lines and resolving the
//! matching pending request. Requests are matched by the `id` the remote echoes;
//! the greeting (and every command in [`CorrelationMode::Serialized`]) goes
//! through a serial gate so that at most one untagged exchange is in flight.
//! In serialized mode the next line answers the waiting command even if it
//! carries an `id` of its own, unless that id belongs to an abandoned request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{decode_line, encode_line, Command, DecodedLine, Endpoint, Response};
use crate::errors::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    /// Commands are pipelined and matched by echoed identity.
    #[default]
    Tagged,
    /// One command in flight per channel; for remotes that do not echo `id`.
    Serialized,
}

type Reply = Result<Response, ChannelError>;

/// How many abandoned request ids are remembered so their late replies are
/// recognised as stale.
const EXPIRED_IDS: usize = 32;

struct Waiter {
    /// Identity we sent, if any.
    expected_id: Option<String>,
    /// Serialized mode: the next line is the reply, whatever `id` it carries.
    any_line: bool,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct PendingTable {
    by_id: HashMap<String, oneshot::Sender<Reply>>,
    untagged: Option<Waiter>,
    expired: VecDeque<String>,
    closed: bool,
}

impl PendingTable {
    fn len(&self) -> usize {
        self.by_id.len() + usize::from(self.untagged.is_some())
    }

    fn is_expired(&self, id: Option<&str>) -> bool {
        id.is_some_and(|id| self.expired.iter().any(|e| e == id))
    }

    fn expire(&mut self, id: String) {
        if self.expired.len() == EXPIRED_IDS {
            self.expired.pop_front();
        }
        self.expired.push_back(id);
    }

    /// Hand a decoded line to the request it belongs to. The `id` is removed
    /// from the payload only when it matched the identity we sent.
    fn route(&mut self, mut decoded: DecodedLine) -> Option<DecodedLine> {
        if let Some(id) = decoded.id.as_deref() {
            if let Some(tx) = self.by_id.remove(id) {
                decoded.response.strip_id();
                let _ = tx.send(Ok(decoded.response));
                return None;
            }
        }

        let id = decoded.id.as_deref();
        let stale = self.is_expired(id);
        let untagged = self.untagged.as_ref().map(|waiter| {
            let echoed = id.is_some() && waiter.expected_id.as_deref() == id;
            let accepts = echoed || (!stale && (waiter.any_line || id.is_none()));
            (accepts, echoed)
        });
        if let Some((true, echoed)) = untagged {
            if let Some(waiter) = self.untagged.take() {
                if echoed {
                    decoded.response.strip_id();
                }
                let _ = waiter.tx.send(Ok(decoded.response));
                return None;
            }
        }

        // A line whose id is not ours is unambiguous only when a single
        // request is waiting. Its `id` then belongs to the payload.
        if !stale && self.untagged.is_none() && self.by_id.len() == 1 {
            if let Some(key) = self.by_id.keys().next().cloned() {
                if let Some(tx) = self.by_id.remove(&key) {
                    let _ = tx.send(Ok(decoded.response));
                    return None;
                }
            }
        }

        Some(decoded)
    }

    /// Fail every waiter. With a socket error as `cause` each one gets a
    /// [`ChannelError::Io`] carrying it, otherwise `ConnectionLost`.
    fn fail_all(&mut self, endpoint: &Endpoint, cause: Option<&std::io::Error>) -> usize {
        self.closed = true;
        let error = || match cause {
            Some(e) => ChannelError::Io {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(e.kind(), e.to_string()),
            },
            None => ChannelError::ConnectionLost {
                endpoint: endpoint.clone(),
            },
        };
        let mut failed = 0;
        for (_, tx) in self.by_id.drain() {
            let _ = tx.send(Err(error()));
            failed += 1;
        }
        if let Some(waiter) = self.untagged.take() {
            let _ = waiter.tx.send(Err(error()));
            failed += 1;
        }
        failed
    }
}

/// Invoked once by the reader task when the socket is gone.
pub(crate) type CloseHook = Box<dyn FnOnce(u64) + Send>;

pub struct Channel {
    endpoint: Endpoint,
    generation: u64,
    mode: CorrelationMode,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingTable>>,
    serial_gate: Mutex<()>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    opened_at: Instant,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Channel {
    /// Connect to `endpoint`. A connect that outlives `connect_timeout` is
    /// dropped, which releases the half-open socket.
    pub(crate) async fn open(
        endpoint: Endpoint,
        generation: u64,
        connect_timeout: Duration,
        mode: CorrelationMode,
        on_close: CloseHook,
    ) -> Result<Channel, ChannelError> {
        let stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.address()))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(ChannelError::Connect { endpoint, source }),
                Err(_elapsed) => {
                    return Err(ChannelError::ConnectTimeout {
                        endpoint,
                        timeout: connect_timeout,
                    })
                }
            };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %endpoint, "Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let pending: Arc<Mutex<PendingTable>> = Arc::new(Mutex::new(PendingTable::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let writer = tokio::spawn(write_loop(
            endpoint.clone(),
            write_half,
            rx,
            pending.clone(),
            closed.clone(),
            shutdown.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            endpoint.clone(),
            generation,
            read_half,
            pending.clone(),
            closed.clone(),
            shutdown.clone(),
            on_close,
        ));

        info!(endpoint = %endpoint, generation, "Channel connected");

        Ok(Channel {
            endpoint,
            generation,
            mode,
            outbound: tx,
            pending,
            serial_gate: Mutex::new(()),
            closed,
            shutdown,
            opened_at: Instant::now(),
            reader,
            writer,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send one command and wait for its reply. No retries happen here; a
    /// deadline of `timeout` applies from the moment the request is registered.
    pub async fn send(&self, command: &Command, timeout: Duration) -> Result<Response, ChannelError> {
        let untagged = !command.is_tagged() || self.mode == CorrelationMode::Serialized;
        let _gate = if untagged {
            Some(self.serial_gate.lock().await)
        } else {
            None
        };

        let id = command
            .is_tagged()
            .then(|| Uuid::new_v4().to_string());
        let line = encode_line(command, id.as_deref())?;
        let (tx, rx) = oneshot::channel::<Reply>();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(ChannelError::ConnectionLost {
                    endpoint: self.endpoint.clone(),
                });
            }
            if untagged {
                pending.untagged = Some(Waiter {
                    expected_id: id.clone(),
                    any_line: self.mode == CorrelationMode::Serialized,
                    tx,
                });
            } else if let Some(id) = &id {
                pending.by_id.insert(id.clone(), tx);
            }
        }

        debug!(
            endpoint = %self.endpoint,
            command = command.name(),
            id = id.as_deref().unwrap_or("-"),
            "Sending command"
        );

        if self.outbound.send(line).is_err() {
            self.forget(id.as_deref(), untagged).await;
            return Err(ChannelError::ConnectionLost {
                endpoint: self.endpoint.clone(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_canceled)) => Err(ChannelError::ConnectionLost {
                endpoint: self.endpoint.clone(),
            }),
            Err(_elapsed) => {
                self.forget(id.as_deref(), untagged).await;
                warn!(
                    endpoint = %self.endpoint,
                    command = command.name(),
                    id = id.as_deref().unwrap_or("-"),
                    "Timed out waiting for response"
                );
                Err(ChannelError::CommandTimeout {
                    endpoint: self.endpoint.clone(),
                    timeout,
                })
            }
        }
    }

    async fn forget(&self, id: Option<&str>, untagged: bool) {
        let mut pending = self.pending.lock().await;
        if untagged {
            pending.untagged = None;
        } else if let Some(id) = id {
            pending.by_id.remove(id);
        }
        if let Some(id) = id {
            pending.expire(id.to_string());
        }
    }

    /// Tear the connection down. Pending requests fail with `ConnectionLost`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, generation = self.generation, "Closing channel");
        }
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
        self.writer.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn write_loop(
    endpoint: Endpoint,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<PendingTable>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            write_half.write_all(line.as_bytes()).await?;
            write_half.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(endpoint = %endpoint, "Socket write failed: {}", e);
            closed.store(true, Ordering::SeqCst);
            pending.lock().await.fail_all(&endpoint, Some(&e));
            shutdown.notify_one();
            break;
        }
    }
}

async fn read_loop(
    endpoint: Endpoint,
    generation: u64,
    read_half: OwnedReadHalf,
    pending: Arc<Mutex<PendingTable>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    on_close: CloseHook,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut cause = None;
    loop {
        tokio::select! {
            biased;

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let decoded = decode_line(&line);
                    if let Some(unmatched) = pending.lock().await.route(decoded) {
                        warn!(
                            endpoint = %endpoint,
                            id = unmatched.id.as_deref().unwrap_or("-"),
                            preview = %line.chars().take(120).collect::<String>(),
                            "Dropping response with no matching request"
                        );
                    }
                }
                Ok(None) => {
                    info!(endpoint = %endpoint, "Remote closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "Socket read failed: {}", e);
                    cause = Some(e);
                    break;
                }
            },
            _ = shutdown.notified() => {
                debug!(endpoint = %endpoint, "Reader shutdown requested");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let failed = pending.lock().await.fail_all(&endpoint, cause.as_ref());
    if failed > 0 {
        warn!(
            endpoint = %endpoint,
            failed,
            "Connection closed with requests still pending"
        );
    }
    on_close(generation);
}
