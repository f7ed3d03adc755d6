//! Engine wire format: newline-delimited JSON.
//!
//! Outbound: `{"command": ["name", arg, ...]}`. Inbound: event objects
//! (`{"event": "end-file", ...}`) and command replies (`{"error": "success"}`).

use serde_json::{Value, json};

/// A structured engine command.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineCommand {
    name: String,
    args: Vec<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    AppendPlay,
}

impl LoadMode {
    fn as_str(self) -> &'static str {
        match self {
            LoadMode::Replace => "replace",
            LoadMode::AppendPlay => "append-play",
        }
    }
}

impl EngineCommand {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn load_file(url: &str, mode: LoadMode) -> Self {
        Self::new("loadfile", vec![json!(url), json!(mode.as_str())])
    }

    pub fn set_property(property: &str, value: impl Into<Value>) -> Self {
        Self::new("set_property", vec![json!(property), value.into()])
    }

    pub fn observe_property(id: u64, property: &str) -> Self {
        Self::new("observe_property", vec![json!(id), json!(property)])
    }

    pub fn cycle(property: &str) -> Self {
        Self::new("cycle", vec![json!(property)])
    }

    pub fn stop() -> Self {
        Self::new("stop", Vec::new())
    }

    pub fn quit() -> Self {
        Self::new("quit", Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialized command, newline terminated.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut command = Vec::with_capacity(self.args.len() + 1);
        command.push(Value::String(self.name.clone()));
        command.extend(self.args.iter().cloned());
        let mut line = serde_json::to_string(&json!({ "command": command }))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    Eof,
    Stop,
    Quit,
    Error(String),
    Redirect,
    Unknown,
}

/// Inbound engine message.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    StartFile,
    FileLoaded,
    EndFile(EndReason),
    Idle,
    PropertyChange { name: String, data: Value },
    Shutdown,
    Reply { error: String },
    Other(String),
}

pub fn parse_event(raw: &str) -> Option<EngineEvent> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;

    let Some(event) = object.get("event").and_then(Value::as_str) else {
        let error = object.get("error").and_then(Value::as_str)?;
        return Some(EngineEvent::Reply {
            error: error.to_string(),
        });
    };

    Some(match event {
        "start-file" => EngineEvent::StartFile,
        "file-loaded" | "playback-restart" => EngineEvent::FileLoaded,
        "idle" => EngineEvent::Idle,
        "shutdown" => EngineEvent::Shutdown,
        "end-file" => {
            let reason = match object.get("reason").and_then(Value::as_str) {
                Some("eof") => EndReason::Eof,
                Some("stop") => EndReason::Stop,
                Some("quit") => EndReason::Quit,
                Some("redirect") => EndReason::Redirect,
                Some("error") => EndReason::Error(
                    object
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                ),
                _ => EndReason::Unknown,
            };
            EngineEvent::EndFile(reason)
        }
        "property-change" => EngineEvent::PropertyChange {
            name: object
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: object.get("data").cloned().unwrap_or(Value::Null),
        },
        other => EngineEvent::Other(other.to_string()),
    })
}
