use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::{Command, Response};
use crate::config::BridgeConfig;
use crate::errors::ChannelError;
use crate::lifecycle::ChannelManager;

/// Fixed-interval retry for transport failures.
///
/// Decoded replies, including remote rejections and undecodable lines, are
/// returned on the first attempt that produces them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay)
    }

    pub async fn send_with_retry(
        &self,
        manager: &ChannelManager,
        command: &Command,
        attempt_timeout: Duration,
    ) -> Result<Response, ChannelError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match manager.acquire().await {
                Ok(channel) => match channel.send(command, attempt_timeout).await {
                    Ok(response) => {
                        manager.connectivity().record_success();
                        if attempt > 1 {
                            debug!(command = command.name(), attempt, "Command succeeded after retry");
                        }
                        return Ok(response);
                    }
                    Err(e) => {
                        if e.is_transport() {
                            manager.discard(&channel);
                        }
                        e
                    }
                },
                Err(e) => e,
            };

            if !error.is_transport() || attempt >= max_attempts {
                if error.is_transport() {
                    warn!(
                        command = command.name(),
                        attempts = attempt,
                        "Giving up: {}",
                        error
                    );
                }
                return Err(error);
            }

            debug!(
                command = command.name(),
                attempt,
                max_attempts,
                delay_ms = self.delay.as_millis() as u64,
                "Transport failure, retrying: {}",
                error
            );
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}
