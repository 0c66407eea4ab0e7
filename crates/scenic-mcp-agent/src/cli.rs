use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use scenic_bridge::{
    BridgeConfig, CorrelationMode, Endpoint, SupervisorConfig, DEFAULT_HOST, DEFAULT_PORT,
};

/// MCP server for driving Scenic applications
#[derive(Parser, Debug)]
#[command(name = "scenic-mcp-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Host the Scenic app's command socket listens on
    #[arg(long, env = "SCENIC_MCP_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port the Scenic app's command socket listens on
    #[arg(long, env = "SCENIC_MCP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Per-attempt deadline for one command
    #[arg(long, env = "SCENIC_MCP_COMMAND_TIMEOUT_MS", default_value_t = 5000)]
    pub command_timeout_ms: u64,

    /// Attempts per command before a transport failure is reported
    #[arg(long, env = "SCENIC_MCP_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Pause between attempts
    #[arg(long, env = "SCENIC_MCP_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// One command in flight at a time, for apps that do not echo request ids
    #[arg(long, env = "SCENIC_MCP_SERIALIZED")]
    pub serialized: bool,

    /// Program used by start_app
    #[arg(long, env = "SCENIC_MCP_APP_COMMAND", default_value = "mix")]
    pub app_command: String,

    /// Argument for the start_app program; repeat for several (default: run --no-halt)
    #[arg(long = "app-arg", allow_hyphen_values = true)]
    pub app_args: Vec<String>,

    /// Number of application output lines kept in memory
    #[arg(long, env = "SCENIC_MCP_LOG_CAPACITY", default_value_t = 1000)]
    pub log_capacity: usize,

    /// Directory for daily-rotated log files
    #[arg(long, env = "SCENIC_MCP_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "SCENIC_MCP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            endpoint: Endpoint::new(self.host.clone(), self.port),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            correlation: if self.serialized {
                CorrelationMode::Serialized
            } else {
                CorrelationMode::Tagged
            },
            ..BridgeConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let defaults = SupervisorConfig::default();
        SupervisorConfig {
            program: self.app_command.clone(),
            args: if self.app_args.is_empty() {
                defaults.args.clone()
            } else {
                self.app_args.clone()
            },
            log_capacity: self.log_capacity,
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["scenic-mcp-agent"]).unwrap();
        let bridge = cli.bridge_config();
        assert_eq!(bridge.endpoint, Endpoint::new("localhost", 9999));
        assert_eq!(bridge.command_timeout, Duration::from_secs(5));
        assert_eq!(bridge.correlation, CorrelationMode::Tagged);

        let supervisor = cli.supervisor_config();
        assert_eq!(supervisor.program, "mix");
        assert_eq!(supervisor.args, vec!["run", "--no-halt"]);
        assert_eq!(supervisor.log_capacity, 1000);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "scenic-mcp-agent",
            "--port",
            "4100",
            "--serialized",
            "--max-attempts",
            "5",
            "--app-command",
            "elixir",
            "--app-arg",
            "-S",
            "--app-arg",
            "mix",
        ])
        .unwrap();
        let bridge = cli.bridge_config();
        assert_eq!(bridge.endpoint.port, 4100);
        assert_eq!(bridge.max_attempts, 5);
        assert_eq!(bridge.correlation, CorrelationMode::Serialized);
        assert_eq!(cli.supervisor_config().args, vec!["-S", "mix"]);
    }
}
