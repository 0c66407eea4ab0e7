//! Command channel between an automation agent and a running Scenic
//! application: a line-delimited JSON socket with per-request correlation,
//! retry, a reachability cache, and supervision of the app process itself.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod errors;
pub mod lifecycle;
pub mod log_buffer;
pub mod retry;
pub mod supervisor;

pub use channel::{Channel, CorrelationMode};
pub use codec::{
    decode_line, encode_line, Action, Command, DecodedLine, Endpoint, Modifier, MouseButton,
    Response, ScreenshotFormat, DEFAULT_HOST, DEFAULT_PORT,
};
pub use config::{BridgeConfig, SupervisorConfig};
pub use connectivity::{ConnectivityCache, ConnectivityRecord, ConnectivitySnapshot, LinkState};
pub use dispatcher::{ConnectionInfo, Dispatcher, ToolOutcome, DEFAULT_LOG_LINES};
pub use errors::{BridgeError, ChannelError, ProcessError};
pub use lifecycle::ChannelManager;
pub use log_buffer::{LogBuffer, LogLine, LogStream};
pub use retry::RetryPolicy;
pub use supervisor::{
    ExitSummary, LaunchSpec, ProcessStatus, ProcessSupervisor, StartReport, StopReport,
};
