//! Runtime settings of the playback controllers.
//!
//! Built from the configuration through [`crate::PlayerConfigExt`] or
//! assembled by hand (tests, embedding applications).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::Endpoint;
use crate::model::PlaybackState;

pub const DEFAULT_RESOLVER_NAME: &str = "yt-dlp";
pub const DEFAULT_ENGINE_NAME: &str = "mpv";
pub const DEFAULT_IPC_PREFIX: &str = "loraradio-mpv";

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_BUDGET_MS: u64 = 3_000;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RADIO_RECONNECT_DELAY_MS: u64 = 2_000;
pub const DEFAULT_VIDEO_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];

/// Reconnection policy of the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Reconnect delay is `base_delay * retry_count`.
    pub base_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolverSettings {
    pub program: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            program: locate_program("", DEFAULT_RESOLVER_NAME),
            cookies_file: None,
            timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub program: PathBuf,
    pub ipc_prefix: String,
    pub ipc_directory: PathBuf,
    /// Fixed endpoint; derived from the host process when `None`.
    pub endpoint: Option<Endpoint>,
    pub restart_delay: Duration,
    /// Handed to the engine for HTTP requests (`cookies-file` property).
    pub cookies_file: Option<PathBuf>,
    pub shutdown_budget: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: locate_program("", DEFAULT_ENGINE_NAME),
            ipc_prefix: DEFAULT_IPC_PREFIX.to_string(),
            ipc_directory: env::temp_dir(),
            endpoint: None,
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            cookies_file: None,
            shutdown_budget: Duration::from_millis(DEFAULT_SHUTDOWN_BUDGET_MS),
        }
    }
}

impl EngineSettings {
    /// Endpoint to hand to a new engine instance.
    pub fn endpoint(&self) -> Endpoint {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Endpoint::for_host_process(&self.ipc_directory, &self.ipc_prefix),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlayerSettings {
    pub resolver: ResolverSettings,
    pub engine: EngineSettings,
    pub channel: RetryPolicy,
    /// Delay before reloading a stalled radio stream.
    pub radio_reconnect_delay: Duration,
    /// Host markers routing a URL to the resolver-backed player.
    pub video_domains: Vec<String>,
    /// Persisted volume and mute, applied when the engine connects.
    pub initial: PlaybackState,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            resolver: ResolverSettings::default(),
            engine: EngineSettings::default(),
            channel: RetryPolicy::default(),
            radio_reconnect_delay: Duration::from_millis(DEFAULT_RADIO_RECONNECT_DELAY_MS),
            video_domains: DEFAULT_VIDEO_DOMAINS.iter().map(|d| d.to_string()).collect(),
            initial: PlaybackState::default(),
        }
    }
}

/// Picks the executable to launch for `name`.
///
/// Order: the configured path, `thirdparty/<name>` next to the running
/// executable, then the bare name left to the OS `PATH` lookup.
pub fn locate_program(configured: &str, name: &str) -> PathBuf {
    let configured = configured.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }

    let file_name = format!("{name}{}", env::consts::EXE_SUFFIX);
    if let Some(local) = env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join("thirdparty").join(&file_name))
        .filter(|candidate| candidate.is_file())
    {
        return local;
    }

    PathBuf::from(file_name)
}
