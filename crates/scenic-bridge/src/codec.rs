//! Line-oriented wire format shared with the Scenic side.
//!
//! Every command is a single `\n`-terminated line: either the bare greeting
//! `hello` or a JSON object with an `action` field. Structured commands also
//! carry an `id` which a compliant remote echoes back so replies can be matched
//! to their request. Every reply is one `\n`-terminated line as well.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9999;

/// Greeting sent verbatim, without JSON framing.
const HELLO: &str = "hello";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address in the form accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Ctrl,
    Shift,
    Alt,
    Cmd,
}

impl FromStr for Modifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Ok(Modifier::Ctrl),
            "shift" => Ok(Modifier::Shift),
            "alt" | "option" => Ok(Modifier::Alt),
            "cmd" | "command" | "meta" | "super" => Ok(Modifier::Cmd),
            other => Err(format!(
                "unknown modifier '{other}' (expected ctrl, shift, alt or cmd)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl FromStr for MouseButton {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(format!(
                "unknown mouse button '{other}' (expected left, right or middle)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotFormat {
    /// Remote writes a file and replies with its path.
    #[default]
    Path,
    /// Remote replies with the encoded image inline.
    Base64,
}

impl FromStr for ScreenshotFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(ScreenshotFormat::Path),
            "base64" => Ok(ScreenshotFormat::Base64),
            other => Err(format!(
                "unknown screenshot format '{other}' (expected path or base64)"
            )),
        }
    }
}

/// Structured commands understood by the remote, one variant per `action`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Status,
    SendKeys {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        modifiers: Vec<Modifier>,
    },
    SendMouseMove {
        x: f64,
        y: f64,
    },
    SendMouseClick {
        x: f64,
        y: f64,
        button: MouseButton,
    },
    #[serde(rename = "get_scenic_graph")]
    InspectViewport {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail_level: Option<String>,
    },
    TakeScreenshot {
        format: ScreenshotFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Status => "status",
            Action::SendKeys { .. } => "send_keys",
            Action::SendMouseMove { .. } => "send_mouse_move",
            Action::SendMouseClick { .. } => "send_mouse_click",
            Action::InspectViewport { .. } => "get_scenic_graph",
            Action::TakeScreenshot { .. } => "take_screenshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello,
    Action(Action),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello => HELLO,
            Command::Action(action) => action.name(),
        }
    }

    /// The bare greeting has no JSON framing and so cannot carry an identity.
    pub fn is_tagged(&self) -> bool {
        matches!(self, Command::Action(_))
    }
}

impl From<Action> for Command {
    fn from(action: Action) -> Self {
        Command::Action(action)
    }
}

/// Encode a command as one newline-terminated line. `id` is attached to
/// structured commands and ignored for the greeting.
pub fn encode_line(command: &Command, id: Option<&str>) -> Result<String, serde_json::Error> {
    match command {
        Command::Hello => Ok(format!("{HELLO}\n")),
        Command::Action(action) => {
            let mut value = serde_json::to_value(action)?;
            if let (Some(id), Value::Object(map)) = (id, &mut value) {
                map.insert("id".to_string(), Value::String(id.to_string()));
            }
            let mut line = serde_json::to_string(&value)?;
            line.push('\n');
            Ok(line)
        }
    }
}

/// One decoded reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Any well-formed reply without an `error` field.
    Payload(Value),
    /// The remote explicitly rejected the command with `{"error": ...}`.
    Rejected { message: String, payload: Value },
    /// The line was not valid JSON.
    Malformed { raw: String, reason: String },
}

impl Response {
    /// Drop the echoed `id` once the reply has been matched to its request.
    pub(crate) fn strip_id(&mut self) {
        let payload = match self {
            Response::Payload(value) | Response::Rejected { payload: value, .. } => value,
            Response::Malformed { .. } => return,
        };
        if let Value::Object(map) = payload {
            map.remove("id");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// Candidate request identity read from a top-level `id`. The payload is
    /// left untouched until routing decides the id really was an echo.
    pub id: Option<String>,
    pub response: Response,
}

pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(e) => {
            return DecodedLine {
                id: None,
                response: Response::Malformed {
                    raw: trimmed.to_string(),
                    reason: e.to_string(),
                },
            }
        }
    };

    let id = match value.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let rejection = value.get("error").and_then(|error| match error {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    });

    let response = match rejection {
        Some(message) => Response::Rejected {
            message,
            payload: value,
        },
        None => Response::Payload(value),
    };

    DecodedLine { id, response }
}
