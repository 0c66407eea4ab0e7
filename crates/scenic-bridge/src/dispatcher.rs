//! One entry point per semantic operation.
//!
//! Every operation returns a [`ToolOutcome`] rather than a `Result`: failures
//! are rendered for the caller, and "not connected yet" is a normal state for
//! interactive commands while the Scenic app is still booting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::channel::CorrelationMode;
use crate::codec::{Action, Command, Endpoint, Modifier, MouseButton, Response, ScreenshotFormat};
use crate::config::{BridgeConfig, SupervisorConfig};
use crate::connectivity::ConnectivitySnapshot;
use crate::errors::{BridgeError, ProcessError};
use crate::lifecycle::ChannelManager;
use crate::retry::RetryPolicy;
use crate::supervisor::ProcessSupervisor;

pub const DEFAULT_LOG_LINES: usize = 50;

/// Caller-facing result of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub is_error: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error category when `is_error` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl ToolOutcome {
    pub fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            is_error: false,
            message: message.into(),
            data,
            error_kind: None,
        }
    }

    pub fn failed(error: &BridgeError) -> Self {
        let data = match error {
            BridgeError::Process(ProcessError::ExitedDuringStartup {
                path,
                code,
                recent_logs,
            }) => Some(json!({
                "path": path,
                "exit_code": code,
                "recent_logs": recent_logs,
            })),
            BridgeError::Protocol { raw, .. } => Some(json!({ "raw": raw })),
            _ => None,
        };
        let mut message = error.to_string();
        if let BridgeError::Process(ProcessError::ExitedDuringStartup { recent_logs, .. }) = error {
            if !recent_logs.is_empty() {
                message.push_str("\nRecent output:\n");
                message.push_str(&recent_logs.join("\n"));
            }
        }
        Self {
            is_error: true,
            message,
            data,
            error_kind: Some(error.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub endpoint: Endpoint,
    pub connected: bool,
    pub correlation: &'static str,
    pub connect_attempts: u64,
    pub channel_age_ms: Option<u64>,
    pub in_flight: usize,
    pub connectivity: ConnectivitySnapshot,
}

#[derive(Clone)]
pub struct Dispatcher {
    manager: ChannelManager,
    retry: RetryPolicy,
    command_timeout: Duration,
    correlation: CorrelationMode,
    supervisor: ProcessSupervisor,
}

impl Dispatcher {
    pub fn new(bridge: BridgeConfig, supervisor: SupervisorConfig) -> Self {
        Self {
            manager: ChannelManager::new(&bridge),
            retry: RetryPolicy::from_config(&bridge),
            command_timeout: bridge.command_timeout,
            correlation: bridge.correlation,
            supervisor: ProcessSupervisor::new(supervisor),
        }
    }

    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Send one structured command and classify the reply.
    async fn exchange(&self, action: Action) -> Result<Value, BridgeError> {
        let command = Command::from(action);
        match self
            .retry
            .send_with_retry(&self.manager, &command, self.command_timeout)
            .await?
        {
            Response::Payload(payload) => Ok(payload),
            Response::Rejected { message, .. } => Err(BridgeError::Application(message)),
            Response::Malformed { raw, reason } => Err(BridgeError::Protocol { raw, reason }),
        }
    }

    fn not_connected(&self) -> ToolOutcome {
        let endpoint = self.manager.endpoint();
        ToolOutcome::ok(
            format!(
                "Not connected to Scenic app at {endpoint}. It may still be starting; try connect_scenic or start_app first."
            ),
            Some(json!({ "connected": false, "endpoint": endpoint })),
        )
    }

    /// Reachability check, exchange and rendering shared by the remote
    /// operations.
    async fn remote<F>(&self, action: Action, hard_when_unreachable: bool, render: F) -> ToolOutcome
    where
        F: FnOnce(&Value) -> String,
    {
        if !self.manager.is_reachable(true).await {
            if hard_when_unreachable {
                let endpoint = self.manager.endpoint();
                return ToolOutcome {
                    is_error: true,
                    message: format!(
                        "Cannot {}: Scenic app at {endpoint} is not reachable",
                        action.name().replace('_', " ")
                    ),
                    data: Some(json!({ "connected": false, "endpoint": endpoint })),
                    error_kind: Some("transport"),
                };
            }
            return self.not_connected();
        }

        let name = action.name();
        match self.exchange(action).await {
            Ok(payload) => {
                let message = render(&payload);
                ToolOutcome::ok(message, Some(payload))
            }
            Err(e) => {
                debug!(command = name, kind = e.kind(), "Command failed: {}", e);
                ToolOutcome::failed(&e)
            }
        }
    }

    /// Point at `host`/`port` (keeping whichever is omitted) and try to
    /// establish the channel. An unreachable endpoint is not an error.
    pub async fn connect(&self, host: Option<String>, port: Option<u16>) -> ToolOutcome {
        let current = self.manager.endpoint();
        let endpoint = Endpoint::new(
            host.filter(|h| !h.trim().is_empty())
                .unwrap_or(current.host),
            port.unwrap_or(current.port),
        );
        self.manager.set_endpoint(endpoint.clone());

        if !self.manager.is_reachable(false).await {
            return ToolOutcome::ok(
                format!(
                    "Waiting for connection: Scenic app at {endpoint} is not accepting connections yet. Start it with start_app or retry shortly."
                ),
                Some(json!({ "connected": false, "endpoint": endpoint })),
            );
        }

        // The greeting is informational; a remote that ignores it is still connected.
        let greeting = match self.manager.acquire().await {
            Ok(channel) => match channel.send(&Command::Hello, self.command_timeout).await {
                Ok(Response::Payload(payload)) => {
                    self.manager.connectivity().record_success();
                    Some(payload)
                }
                Ok(other) => {
                    debug!(endpoint = %endpoint, "Unexpected greeting reply: {:?}", other);
                    None
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, "No greeting reply: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!(endpoint = %endpoint, "Channel dropped after probe: {}", e);
                None
            }
        };

        info!(endpoint = %endpoint, "Connected to Scenic app");
        ToolOutcome::ok(
            format!("Connected to Scenic app at {endpoint}"),
            Some(json!({
                "connected": true,
                "endpoint": endpoint,
                "greeting": greeting,
            })),
        )
    }

    /// Local connectivity plus the remote's own status when it answers.
    pub async fn status(&self) -> ToolOutcome {
        let reachable = self.manager.is_reachable(true).await;
        let info = self.connection_info().await;
        let info_value = serde_json::to_value(&info).unwrap_or(Value::Null);
        if !reachable {
            return ToolOutcome::ok(
                format!("Not connected to Scenic app at {}", info.endpoint),
                Some(json!({ "connection": info_value })),
            );
        }
        match self.exchange(Action::Status).await {
            Ok(remote) => ToolOutcome::ok(
                format!("Connected to Scenic app at {}", info.endpoint),
                Some(json!({ "connection": info_value, "remote": remote })),
            ),
            Err(e) => ToolOutcome::failed(&e),
        }
    }

    pub async fn send_keys(
        &self,
        text: Option<String>,
        key: Option<String>,
        modifiers: &[String],
    ) -> ToolOutcome {
        let action = match build_send_keys(text, key, modifiers) {
            Ok(action) => action,
            Err(e) => return ToolOutcome::failed(&e),
        };
        let summary = match &action {
            Action::SendKeys {
                text: Some(text), ..
            } => format!("Sent text {text:?}"),
            Action::SendKeys {
                key: Some(key),
                modifiers,
                ..
            } if !modifiers.is_empty() => {
                let chord: Vec<String> = modifiers
                    .iter()
                    .map(|m| format!("{m:?}").to_lowercase())
                    .collect();
                format!("Sent key {}+{key}", chord.join("+"))
            }
            Action::SendKeys { key: Some(key), .. } => format!("Sent key {key}"),
            _ => "Sent keys".to_string(),
        };
        self.remote(action, false, move |_| summary).await
    }

    pub async fn mouse_move(&self, x: f64, y: f64) -> ToolOutcome {
        if let Err(e) = check_coordinates(x, y) {
            return ToolOutcome::failed(&e);
        }
        self.remote(Action::SendMouseMove { x, y }, false, move |_| {
            format!("Moved mouse to ({x}, {y})")
        })
        .await
    }

    pub async fn mouse_click(&self, x: f64, y: f64, button: Option<&str>) -> ToolOutcome {
        if let Err(e) = check_coordinates(x, y) {
            return ToolOutcome::failed(&e);
        }
        let button = match button.map(str::parse::<MouseButton>).transpose() {
            Ok(button) => button.unwrap_or_default(),
            Err(reason) => return ToolOutcome::failed(&BridgeError::Validation(reason)),
        };
        self.remote(Action::SendMouseClick { x, y, button }, false, move |_| {
            format!("Clicked {} button at ({x}, {y})", format!("{button:?}").to_lowercase())
        })
        .await
    }

    pub async fn inspect_viewport(&self, detail_level: Option<String>) -> ToolOutcome {
        let action = Action::InspectViewport {
            detail_level: detail_level.filter(|d| !d.trim().is_empty()),
        };
        self.remote(action, false, |payload| {
            match payload.get("description").and_then(Value::as_str) {
                Some(description) => description.to_string(),
                None => serde_json::to_string_pretty(payload)
                    .unwrap_or_else(|_| payload.to_string()),
            }
        })
        .await
    }

    /// Screenshots have no degraded form, so an unreachable app is an error.
    pub async fn take_screenshot(
        &self,
        format: Option<&str>,
        filename: Option<String>,
    ) -> ToolOutcome {
        let format = match format.map(str::parse::<ScreenshotFormat>).transpose() {
            Ok(format) => format.unwrap_or_default(),
            Err(reason) => return ToolOutcome::failed(&BridgeError::Validation(reason)),
        };
        let action = Action::TakeScreenshot {
            format,
            filename: filename.filter(|f| !f.trim().is_empty()),
        };
        self.remote(action, true, move |payload| {
            let path = payload.get("path").and_then(Value::as_str);
            match (format, path) {
                (ScreenshotFormat::Base64, _) => {
                    let size = payload
                        .get("size")
                        .and_then(Value::as_u64)
                        .map(|s| format!(" ({s} bytes)"))
                        .unwrap_or_default();
                    format!("Captured screenshot{size}")
                }
                (ScreenshotFormat::Path, Some(path)) => format!("Screenshot saved to {path}"),
                (ScreenshotFormat::Path, None) => "Screenshot captured".to_string(),
            }
        })
        .await
    }

    pub async fn start_app(
        &self,
        path: &str,
        args: Option<Vec<String>>,
        env: Option<HashMap<String, String>>,
    ) -> ToolOutcome {
        let working_dir = PathBuf::from(path);
        if !working_dir.is_absolute() {
            return ToolOutcome::failed(&BridgeError::Validation(format!(
                "path must be absolute: {path}"
            )));
        }
        if !working_dir.is_dir() {
            return ToolOutcome::failed(&BridgeError::Validation(format!(
                "path is not an existing directory: {path}"
            )));
        }

        let mut spec = self.supervisor.default_launch(working_dir);
        if let Some(args) = args {
            spec.args = args;
        }
        if let Some(env) = env {
            spec.env.extend(env);
        }

        match self.supervisor.start(spec).await {
            Ok(report) => ToolOutcome::ok(
                format!(
                    "Started application (PID {}) in {}. Use connect_scenic once it is listening.",
                    report.pid,
                    report.path.display()
                ),
                serde_json::to_value(&report).ok(),
            ),
            Err(e) => ToolOutcome::failed(&BridgeError::from(e)),
        }
    }

    pub async fn stop_app(&self) -> ToolOutcome {
        match self.supervisor.stop().await {
            Ok(report) => {
                // The app's socket is going away with it.
                self.manager.disconnect();
                let how = if report.forced { " (killed)" } else { "" };
                ToolOutcome::ok(
                    format!(
                        "Stopped application (PID {}) from {}{how}",
                        report.pid,
                        report.path.display()
                    ),
                    serde_json::to_value(&report).ok(),
                )
            }
            Err(ProcessError::NotRunning) => {
                ToolOutcome::ok("No application is running", Some(json!({ "running": false })))
            }
            Err(e) => ToolOutcome::failed(&BridgeError::from(e)),
        }
    }

    pub fn app_status(&self) -> ToolOutcome {
        let status = self.supervisor.status();
        let message = match (status.pid, &status.path) {
            (Some(pid), Some(path)) => format!(
                "Application running (PID {pid}) from {}, up {}s",
                path.display(),
                status.uptime_secs.unwrap_or_default()
            ),
            _ => match &status.last_exit {
                Some(exit) => format!(
                    "No application running (last PID {} exited with {})",
                    exit.pid,
                    exit.code
                        .map(|c| format!("code {c}"))
                        .unwrap_or_else(|| "a signal".to_string())
                ),
                None => "No application running".to_string(),
            },
        };
        ToolOutcome::ok(message, serde_json::to_value(&status).ok())
    }

    pub fn app_logs(&self, lines: Option<usize>) -> ToolOutcome {
        let buffer = self.supervisor.log_buffer();
        let requested = lines.unwrap_or(DEFAULT_LOG_LINES).min(buffer.capacity());
        let tail: Vec<String> = self
            .supervisor
            .logs(requested)
            .iter()
            .map(ToString::to_string)
            .collect();
        let message = if tail.is_empty() {
            "No application output captured".to_string()
        } else {
            tail.join("\n")
        };
        ToolOutcome::ok(
            message,
            Some(json!({
                "returned": tail.len(),
                "buffered": buffer.len(),
                "capacity": buffer.capacity(),
                "running": self.supervisor.is_running(),
                "lines": tail,
            })),
        )
    }

    pub async fn connection_info(&self) -> ConnectionInfo {
        let channel = self.manager.current();
        let in_flight = match &channel {
            Some(channel) => channel.in_flight().await,
            None => 0,
        };
        ConnectionInfo {
            endpoint: self.manager.endpoint(),
            connected: channel.is_some(),
            correlation: match self.correlation {
                CorrelationMode::Tagged => "tagged",
                CorrelationMode::Serialized => "serialized",
            },
            connect_attempts: self.manager.connect_attempts(),
            channel_age_ms: channel.as_ref().map(|c| c.age().as_millis() as u64),
            in_flight,
            connectivity: self.manager.connectivity().snapshot(),
        }
    }

    /// Stop the managed process and close the channel.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.manager.disconnect();
    }
}

fn build_send_keys(
    text: Option<String>,
    key: Option<String>,
    modifiers: &[String],
) -> Result<Action, BridgeError> {
    let text = text.filter(|t| !t.is_empty());
    let key = key.filter(|k| !k.trim().is_empty());
    if text.is_none() && key.is_none() {
        return Err(BridgeError::Validation(
            "send_keys requires either 'text' or 'key'".to_string(),
        ));
    }
    let modifiers = modifiers
        .iter()
        .map(|m| m.parse::<Modifier>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(BridgeError::Validation)?;
    Ok(Action::SendKeys {
        text,
        key,
        modifiers,
    })
}

fn check_coordinates(x: f64, y: f64) -> Result<(), BridgeError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(BridgeError::Validation(format!(
            "coordinates must be finite numbers, got ({x}, {y})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_keys_needs_text_or_key() {
        let err = build_send_keys(None, None, &[]).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(build_send_keys(Some(String::new()), Some("  ".into()), &[]).is_err());
    }

    #[test]
    fn test_send_keys_parses_modifiers() {
        let action = build_send_keys(
            None,
            Some("s".into()),
            &["Ctrl".to_string(), "meta".to_string()],
        )
        .unwrap();
        assert_eq!(
            action,
            Action::SendKeys {
                text: None,
                key: Some("s".into()),
                modifiers: vec![Modifier::Ctrl, Modifier::Cmd],
            }
        );
    }

    #[test]
    fn test_unknown_modifier_is_validation_error() {
        let err = build_send_keys(None, Some("a".into()), &["hyper".to_string()]).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(msg) if msg.contains("hyper")));
    }

    #[test]
    fn test_non_finite_coordinates_rejected() {
        assert!(check_coordinates(1.0, 2.5).is_ok());
        assert!(check_coordinates(f64::NAN, 0.0).is_err());
        assert!(check_coordinates(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_startup_failure_outcome_carries_logs() {
        let err = BridgeError::from(ProcessError::ExitedDuringStartup {
            path: PathBuf::from("/srv/app"),
            code: Some(1),
            recent_logs: vec!["[stderr] ** (Mix) Could not compile".to_string()],
        });
        let outcome = ToolOutcome::failed(&err);
        assert!(outcome.is_error);
        assert_eq!(outcome.error_kind, Some("process"));
        assert!(outcome.message.contains("Could not compile"));
        assert_eq!(outcome.data.unwrap()["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_logs_on_fresh_dispatcher() {
        let dispatcher = Dispatcher::new(BridgeConfig::default(), SupervisorConfig::default());
        let outcome = dispatcher.app_logs(Some(5));
        assert!(!outcome.is_error);
        assert_eq!(outcome.data.unwrap()["returned"], 0);
    }
}
