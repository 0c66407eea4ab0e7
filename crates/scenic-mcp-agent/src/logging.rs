use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "scenic-mcp-agent.log";

/// Default location for log files, e.g. `~/.local/share/scenic-mcp/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("scenic-mcp").join("logs"))
}

/// Install the global subscriber. Logs always go to stderr (stdout carries
/// the MCP protocol) and, when a directory is usable, to a daily file.
///
/// The returned guard flushes the file writer and must be held until exit.
pub fn init_logging(log_level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let dir = log_dir.map(Path::to_path_buf).or_else(default_log_dir);
    let (file_layer, guard, file_error) = match dir {
        Some(dir) => match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard), None)
            }
            Err(e) => (None, None, Some((dir, e))),
        },
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    if let Some((dir, e)) = file_error {
        tracing::warn!("File logging disabled, cannot create {}: {}", dir.display(), e);
    }
    Ok(guard)
}
