use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConnectArgs {
    #[schemars(description = "Host the Scenic app listens on (default: current host, initially localhost)")]
    pub host: Option<String>,
    #[schemars(description = "TCP port the Scenic app listens on (default: current port, initially 9999)")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SendKeysArgs {
    #[schemars(description = "Text to type. Either this or 'key' is required.")]
    pub text: Option<String>,
    #[schemars(
        description = "Single named key to press, e.g. 'enter', 'escape', 'tab', 'left', 'f1' or a character"
    )]
    pub key: Option<String>,
    #[schemars(description = "Modifiers held while pressing 'key': ctrl, shift, alt, cmd")]
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MouseMoveArgs {
    #[schemars(description = "X coordinate in viewport pixels")]
    pub x: f64,
    #[schemars(description = "Y coordinate in viewport pixels")]
    pub y: f64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MouseClickArgs {
    #[schemars(description = "X coordinate in viewport pixels")]
    pub x: f64,
    #[schemars(description = "Y coordinate in viewport pixels")]
    pub y: f64,
    #[schemars(description = "Mouse button: left (default), right or middle")]
    pub button: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct InspectViewportArgs {
    #[schemars(description = "Amount of detail requested from the app, e.g. 'summary' or 'full'")]
    pub detail_level: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct TakeScreenshotArgs {
    #[schemars(
        description = "'path' (default) saves a file and returns its path; 'base64' returns the image inline"
    )]
    pub format: Option<String>,
    #[schemars(description = "Optional file name for the saved screenshot")]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StartAppArgs {
    #[schemars(description = "Absolute path to the Scenic application's project directory")]
    pub path: String,
    #[schemars(description = "Arguments for the launch program (default: run --no-halt)")]
    pub args: Option<Vec<String>>,
    #[schemars(description = "Extra environment variables, merged over the defaults (MIX_ENV=dev)")]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct AppLogsArgs {
    #[schemars(description = "Number of most recent log lines to return (default 50)")]
    pub lines: Option<usize>,
}
