use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Endpoint;

/// Transport-level failures. Every variant is retryable by [`crate::RetryPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("Socket error on {endpoint}: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection to {endpoint} lost before a response arrived")]
    ConnectionLost { endpoint: Endpoint },
    #[error("No response from {endpoint} within {timeout:?}")]
    CommandTimeout { endpoint: Endpoint, timeout: Duration },
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChannelError {
    /// Encoding failures are deterministic, everything else is a socket problem
    /// that a fresh connection may fix.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ChannelError::Encode(_))
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            ChannelError::Connect { source, .. }
                if source.kind() == std::io::ErrorKind::ConnectionRefused
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Application already running (PID {pid}) from {}", path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("Failed to spawn {program} in {}: {source}", path.display())]
    Spawn {
        program: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Application in {} exited during startup ({})", path.display(), describe_code(*code))]
    ExitedDuringStartup {
        path: PathBuf,
        code: Option<i32>,
        recent_logs: Vec<String>,
    },
    #[error("No application is currently running")]
    NotRunning,
    #[error("Invalid application path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Caller-visible error taxonomy for dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] ChannelError),
    #[error("Malformed response from Scenic app ({reason}): {raw}")]
    Protocol { raw: String, reason: String },
    #[error("Scenic app reported an error: {0}")]
    Application(String),
    #[error("Invalid arguments: {0}")]
    Validation(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transport(e) => e.is_transport(),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Transport(_) => "transport",
            BridgeError::Protocol { .. } => "protocol",
            BridgeError::Application(_) => "application",
            BridgeError::Validation(_) => "validation",
            BridgeError::Process(_) => "process",
        }
    }
}
