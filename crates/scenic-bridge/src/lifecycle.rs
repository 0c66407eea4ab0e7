//! Owns the one live [`Channel`] for the configured endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::{Channel, CorrelationMode};
use crate::codec::Endpoint;
use crate::config::BridgeConfig;
use crate::connectivity::{ConnectivityCache, LinkState};
use crate::errors::ChannelError;

struct Slot {
    endpoint: Endpoint,
    channel: Option<Arc<Channel>>,
}

struct Shared {
    slot: Mutex<Slot>,
    /// Serialises connection attempts so at most one socket exists per endpoint.
    connect_gate: tokio::sync::Mutex<()>,
    connectivity: ConnectivityCache,
    generation: AtomicU64,
    connect_attempts: AtomicU64,
    connect_timeout: Duration,
    mode: CorrelationMode,
}

impl Shared {
    fn live_channel(&self) -> Option<Arc<Channel>> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.channel
            .as_ref()
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    /// Drop the slot's channel if it is still generation `generation`.
    fn discard(&self, generation: u64) {
        let taken = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            match &slot.channel {
                Some(channel) if channel.generation() == generation => slot.channel.take(),
                _ => None,
            }
        };
        if let Some(channel) = taken {
            debug!(endpoint = %channel.endpoint(), generation, "Discarding channel");
            channel.close();
            self.connectivity.set_state(LinkState::Disconnected);
        }
    }
}

#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
}

impl ChannelManager {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    endpoint: config.endpoint.clone(),
                    channel: None,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
                connectivity: ConnectivityCache::new(
                    config.connection_cache_ttl,
                    config.command_success_ttl,
                ),
                generation: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                connect_timeout: config.connect_timeout,
                mode: config.correlation,
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .endpoint
            .clone()
    }

    pub fn connectivity(&self) -> &ConnectivityCache {
        &self.shared.connectivity
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<Channel>> {
        self.shared.live_channel()
    }

    /// Point the manager at a new endpoint. Any existing channel is closed
    /// first so no command can leak onto the old socket. Returns whether the
    /// endpoint actually changed.
    pub fn set_endpoint(&self, endpoint: Endpoint) -> bool {
        let previous = {
            let mut slot = self.shared.slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.endpoint == endpoint {
                return false;
            }
            slot.endpoint = endpoint.clone();
            slot.channel.take()
        };
        if let Some(channel) = previous {
            info!(
                from = %channel.endpoint(),
                to = %endpoint,
                "Endpoint changed, closing existing channel"
            );
            channel.close();
        } else {
            info!(endpoint = %endpoint, "Endpoint changed");
        }
        self.shared.connectivity.reset();
        true
    }

    /// Return the live channel, connecting if there is none.
    pub async fn acquire(&self) -> Result<Arc<Channel>, ChannelError> {
        if let Some(channel) = self.shared.live_channel() {
            return Ok(channel);
        }

        let _gate = self.shared.connect_gate.lock().await;
        // Another caller may have connected while we waited for the gate.
        if let Some(channel) = self.shared.live_channel() {
            return Ok(channel);
        }

        let endpoint = self.endpoint();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.connectivity.set_state(LinkState::Connecting);
        debug!(endpoint = %endpoint, generation, "Connecting");

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let on_close = Box::new(move |generation: u64| {
            if let Some(shared) = weak.upgrade() {
                shared.discard(generation);
            }
        });

        let channel = match Channel::open(
            endpoint.clone(),
            generation,
            self.shared.connect_timeout,
            self.shared.mode,
            on_close,
        )
        .await
        {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                debug!(endpoint = %endpoint, "Connect failed: {}", e);
                self.shared.connectivity.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        {
            let mut slot = self.shared.slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.endpoint != endpoint {
                warn!(
                    connected = %endpoint,
                    configured = %slot.endpoint,
                    "Endpoint changed while connecting, dropping new channel"
                );
                drop(slot);
                channel.close();
                return Err(ChannelError::ConnectionLost { endpoint });
            }
            slot.channel = Some(channel.clone());
        }
        self.shared.connectivity.set_state(LinkState::Connected);
        Ok(channel)
    }

    /// Close and forget `channel` if it is still the current one, forcing the
    /// next [`acquire`](Self::acquire) to reconnect.
    pub fn discard(&self, channel: &Channel) {
        self.shared.discard(channel.generation());
        channel.close();
    }

    /// Close whatever channel is open.
    pub fn disconnect(&self) {
        let taken = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .channel
            .take();
        if let Some(channel) = taken {
            channel.close();
            self.shared.connectivity.set_state(LinkState::Disconnected);
        }
    }

    /// Probe reachability: a live channel counts, otherwise try to open one.
    pub async fn probe(&self) -> bool {
        let reachable = if self.shared.live_channel().is_some() {
            true
        } else {
            match self.acquire().await {
                Ok(_) => true,
                Err(e) => {
                    debug!(endpoint = %self.endpoint(), "Probe failed: {}", e);
                    false
                }
            }
        };
        self.shared.connectivity.record_probe(reachable);
        reachable
    }

    /// Cached reachability, probing only when the cache has nothing fresh.
    pub async fn is_reachable(&self, use_cache: bool) -> bool {
        if let Some(answer) = self.shared.connectivity.cached(use_cache) {
            return answer;
        }
        self.probe().await
    }
}
