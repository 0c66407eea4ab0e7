//! Short-lived memo of whether the Scenic app is reachable.
//!
//! A successful command within `command_success_ttl` answers "reachable"
//! outright; otherwise a probe result younger than `connection_cache_ttl` is
//! reused. Only when both are stale does the caller need to probe again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

pub const CONNECTION_CACHE_TTL: Duration = Duration::from_secs(2);
pub const COMMAND_SUCCESS_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityRecord {
    pub state: LinkState,
    pub last_probed_at: Option<Instant>,
    pub last_probe_result: bool,
    pub last_success_at: Option<Instant>,
}

/// Serializable view of the record with ages instead of instants.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivitySnapshot {
    pub state: LinkState,
    pub last_probe_result: bool,
    pub last_probe_age_ms: Option<u64>,
    pub last_success_age_ms: Option<u64>,
    pub probe_count: u64,
}

pub struct ConnectivityCache {
    record: Mutex<ConnectivityRecord>,
    /// Last settled reachability, used to log only real transitions.
    settled: Mutex<Option<bool>>,
    probes: AtomicU64,
    connection_cache_ttl: Duration,
    command_success_ttl: Duration,
}

impl ConnectivityCache {
    pub fn new(connection_cache_ttl: Duration, command_success_ttl: Duration) -> Self {
        Self {
            record: Mutex::new(ConnectivityRecord::default()),
            settled: Mutex::new(None),
            probes: AtomicU64::new(0),
            connection_cache_ttl,
            command_success_ttl,
        }
    }

    /// Answer from memory if either freshness window still holds.
    pub fn cached(&self, use_cache: bool) -> Option<bool> {
        if !use_cache {
            return None;
        }
        let record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        if record
            .last_success_at
            .is_some_and(|at| at.elapsed() < self.command_success_ttl)
        {
            return Some(true);
        }
        if let Some(at) = record.last_probed_at {
            if at.elapsed() < self.connection_cache_ttl {
                return Some(record.last_probe_result);
            }
        }
        None
    }

    pub fn record_probe(&self, reachable: bool) {
        self.probes.fetch_add(1, Ordering::SeqCst);
        {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            record.last_probed_at = Some(Instant::now());
            record.last_probe_result = reachable;
        }
        self.set_state(if reachable {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        });
    }

    pub fn record_success(&self) {
        {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            record.last_success_at = Some(Instant::now());
        }
        self.set_state(LinkState::Connected);
    }

    pub fn set_state(&self, state: LinkState) {
        {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            record.state = state;
            if state == LinkState::Disconnected {
                // A dead socket voids the "recently worked" shortcut.
                record.last_success_at = None;
                if record.last_probe_result {
                    record.last_probed_at = None;
                }
            }
        }

        let reachable = match state {
            LinkState::Connected => true,
            LinkState::Disconnected => false,
            LinkState::Unknown | LinkState::Connecting => return,
        };
        let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
        match *settled {
            Some(previous) if previous != reachable => {
                if reachable {
                    info!("Scenic app connection restored");
                } else {
                    warn!("Scenic app connection lost");
                }
            }
            _ => {}
        }
        *settled = Some(reachable);
    }

    /// Forget everything, e.g. after the endpoint changed.
    pub fn reset(&self) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = ConnectivityRecord::default();
        *self.settled.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn record(&self) -> ConnectivityRecord {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        let record = self.record();
        ConnectivitySnapshot {
            state: record.state,
            last_probe_result: record.last_probe_result,
            last_probe_age_ms: record
                .last_probed_at
                .map(|at| at.elapsed().as_millis() as u64),
            last_success_age_ms: record
                .last_success_at
                .map(|at| at.elapsed().as_millis() as u64),
            probe_count: self.probe_count(),
        }
    }
}

impl Default for ConnectivityCache {
    fn default() -> Self {
        Self::new(CONNECTION_CACHE_TTL, COMMAND_SUCCESS_TTL)
    }
}
