use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The executable could not be launched (missing, not executable...).
#[derive(Debug, Error)]
#[error("failed to start {}: {source}", .program.display())]
pub struct StartError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error("resolver timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("resolver returned an unexpected output: {0}")]
    UnexpectedOutput(String),

    #[error("resolver returned no stream URL{}", stderr_suffix(.stderr))]
    EmptyOutput { stderr: String },

    #[error("resolver I/O error: {0}")]
    Io(#[from] io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let last = stderr.lines().rev().find(|l| !l.trim().is_empty());
    match last {
        Some(line) => format!(" ({})", line.trim()),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The command was dropped because no connection is established.
    #[error("control channel not connected, dropped '{0}'")]
    NotConnected(String),

    #[error("unable to connect to {endpoint} after {attempts} attempt(s)")]
    ConnectFailed { endpoint: String, attempts: u32 },

    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures surfaced by the playback controllers.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Empty URL provided")]
    EmptyUrl,

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("Failed to resolve stream: {0}")]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("playback engine exited (code {code:?})")]
    EngineExited { code: Option<i32> },

    #[error("Failed to play media: {0}")]
    Playback(String),
}

impl PlayerError {
    pub fn playback(msg: impl Into<String>) -> Self {
        Self::Playback(msg.into())
    }
}
