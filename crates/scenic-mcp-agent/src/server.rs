use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{tool, tool_router, ErrorData as McpError, ServerHandler};
use scenic_bridge::{BridgeConfig, Dispatcher, SupervisorConfig, ToolOutcome};
use serde_json::Value;
use tracing::{info, warn};

use crate::utils::{
    AppLogsArgs, ConnectArgs, InspectViewportArgs, MouseClickArgs, MouseMoveArgs, SendKeysArgs,
    StartAppArgs, TakeScreenshotArgs,
};

/// Render a dispatcher outcome as a tool result: the message as text, the
/// structured data as JSON.
pub fn render_outcome(outcome: ToolOutcome) -> Result<CallToolResult, McpError> {
    let mut content = vec![Content::text(outcome.message)];
    if let Some(data) = outcome.data {
        content.push(Content::json(data)?);
    }
    Ok(if outcome.is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    })
}

/// Like [`render_outcome`], but an inline base64 screenshot becomes image
/// content instead of a JSON string.
fn render_screenshot(mut outcome: ToolOutcome) -> Result<CallToolResult, McpError> {
    if outcome.is_error {
        return render_outcome(outcome);
    }
    let image = match outcome.data.as_mut() {
        Some(Value::Object(map)) => match map.remove("data") {
            Some(Value::String(data)) => Some(data),
            Some(other) => {
                map.insert("data".to_string(), other);
                None
            }
            None => None,
        },
        _ => None,
    };

    let mut result = render_outcome(outcome)?;
    if let Some(data) = image {
        result.content.push(Content::image(data, "image/png"));
    }
    Ok(result)
}

#[derive(Clone)]
pub struct ScenicMcpServer {
    dispatcher: Dispatcher,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl ScenicMcpServer {
    pub fn new(bridge: BridgeConfig, supervisor: SupervisorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(bridge, supervisor),
            tool_router: Self::tool_router(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stop the managed app and close the socket.
    pub async fn shutdown(&self) {
        info!("Shutting down, stopping managed application if any");
        self.dispatcher.shutdown().await;
    }

    #[tool(
        description = "Connect to a running Scenic app's command socket. Optionally switch host/port (default localhost:9999). If the app is not listening yet this returns a non-error 'waiting for connection' result; retry after the app has booted."
    )]
    pub async fn connect_scenic(
        &self,
        Parameters(args): Parameters<ConnectArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.connect(args.host, args.port).await)
    }

    #[tool(
        description = "Report connection state (endpoint, cached reachability, connect attempts) and, when connected, the Scenic app's own status. Read-only."
    )]
    pub async fn get_scenic_status(&self) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.status().await)
    }

    #[tool(
        description = "Send keyboard input to the Scenic app. Provide 'text' to type a string, or 'key' (e.g. enter, escape, tab, left, a) with optional 'modifiers' (ctrl, shift, alt, cmd)."
    )]
    pub async fn send_keys(
        &self,
        Parameters(args): Parameters<SendKeysArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(
            self.dispatcher
                .send_keys(args.text, args.key, &args.modifiers)
                .await,
        )
    }

    #[tool(description = "Move the mouse cursor to (x, y) in viewport pixels.")]
    pub async fn send_mouse_move(
        &self,
        Parameters(args): Parameters<MouseMoveArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.mouse_move(args.x, args.y).await)
    }

    #[tool(
        description = "Click at (x, y) in viewport pixels. 'button' is left (default), right or middle."
    )]
    pub async fn send_mouse_click(
        &self,
        Parameters(args): Parameters<MouseClickArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(
            self.dispatcher
                .mouse_click(args.x, args.y, args.button.as_deref())
                .await,
        )
    }

    #[tool(
        description = "Describe what the Scenic viewport currently shows (scene graph summary: components, text, buttons and their positions). Use before interacting. Read-only."
    )]
    pub async fn inspect_viewport(
        &self,
        Parameters(args): Parameters<InspectViewportArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.inspect_viewport(args.detail_level).await)
    }

    #[tool(
        description = "Capture the Scenic viewport. format 'path' (default) saves a PNG and returns its path; 'base64' returns the image inline. Fails if the app is not reachable."
    )]
    pub async fn take_screenshot(
        &self,
        Parameters(args): Parameters<TakeScreenshotArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_screenshot(
            self.dispatcher
                .take_screenshot(args.format.as_deref(), args.filename)
                .await,
        )
    }

    #[tool(
        description = "Start the Scenic application found at an absolute project directory path (runs 'mix run --no-halt' with MIX_ENV=dev unless overridden). Fails if an app is already running or if it exits within the startup grace period."
    )]
    pub async fn start_app(
        &self,
        Parameters(args): Parameters<StartAppArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(
            self.dispatcher
                .start_app(&args.path, args.args, args.env)
                .await,
        )
    }

    #[tool(
        description = "Stop the managed Scenic application: graceful termination first, forced kill if it does not exit within a second."
    )]
    pub async fn stop_app(&self) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.stop_app().await)
    }

    #[tool(
        description = "Report whether the managed application is running, with PID, path, uptime, memory/CPU usage and the last exit if it stopped. Read-only."
    )]
    pub async fn app_status(&self) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.app_status())
    }

    #[tool(
        description = "Return the most recent output lines of the managed application, tagged [stdout], [stderr] or [supervisor]. Logs survive a crash until the next start. Read-only."
    )]
    pub async fn get_app_logs(
        &self,
        Parameters(args): Parameters<AppLogsArgs>,
    ) -> Result<CallToolResult, McpError> {
        render_outcome(self.dispatcher.app_logs(args.lines))
    }
}

impl ServerHandler for ScenicMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(crate::prompt::get_server_instructions(
                &self.dispatcher.manager().endpoint(),
            )),
        }
    }

    async fn call_tool(
        &self,
        request: rmcp::model::CallToolRequestParam,
        context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        use rmcp::handler::server::tool::ToolCallContext;

        let tool_name = request.name.to_string();
        let start_time = Instant::now();

        let tcc = ToolCallContext::new(self, request, context);
        let result = self.tool_router.call(tcc).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        match &result {
            Ok(call_result) if call_result.is_error == Some(true) => {
                warn!(tool = %tool_name, duration_ms, "Tool returned an error result");
            }
            Ok(_) => info!(tool = %tool_name, duration_ms, "Tool call completed"),
            Err(e) => warn!(tool = %tool_name, duration_ms, "Tool call failed: {}", e.message),
        }

        result
    }

    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<rmcp::model::ListToolsResult, McpError> {
        Ok(rmcp::model::ListToolsResult::with_all_items(
            self.tool_router.list_all(),
        ))
    }
}
