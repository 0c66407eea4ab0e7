use std::collections::HashMap;
use std::time::Duration;

use crate::channel::CorrelationMode;
use crate::codec::Endpoint;
use crate::connectivity::{COMMAND_SUCCESS_TTL, CONNECTION_CACHE_TTL};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Settings for the command channel.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Deadline for one request on one attempt.
    pub command_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connection_cache_ttl: Duration,
    pub command_success_ttl: Duration,
    pub correlation: CorrelationMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            connection_cache_ttl: CONNECTION_CACHE_TTL,
            command_success_ttl: COMMAND_SUCCESS_TTL,
            correlation: CorrelationMode::Tagged,
        }
    }
}

/// Settings for the managed application process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub log_capacity: usize,
    /// Program launched inside the application directory.
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: DEFAULT_STARTUP_GRACE,
            stop_grace: DEFAULT_STOP_GRACE,
            log_capacity: DEFAULT_LOG_CAPACITY,
            program: "mix".to_string(),
            args: vec!["run".to_string(), "--no-halt".to_string()],
            env: HashMap::from([("MIX_ENV".to_string(), "dev".to_string())]),
        }
    }
}
