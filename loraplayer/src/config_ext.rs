//! Player settings stored in `loraconfig`.
//!
//! The getters persist their default value when the key is missing, so a
//! fresh `config.yaml` documents every knob.
//!
//! # Example
//!
//! ```no_run
//! use loraconfig::Config;
//! use loraplayer::PlayerConfigExt;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load_config("")?;
//! config.set_player_volume(35)?;
//! let settings = config.player_settings()?;
//! assert_eq!(settings.initial.volume, 35);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use loraconfig::Config;

use crate::model::PlaybackState;
use crate::settings::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_ENGINE_NAME, DEFAULT_IPC_PREFIX,
    DEFAULT_MAX_RETRIES, DEFAULT_RADIO_RECONNECT_DELAY_MS, DEFAULT_RESOLVE_TIMEOUT_MS,
    DEFAULT_RESOLVER_NAME, DEFAULT_RESTART_DELAY_MS, DEFAULT_SHUTDOWN_BUDGET_MS,
    DEFAULT_VIDEO_DOMAINS, EngineSettings, PlayerSettings, ResolverSettings, RetryPolicy,
    locate_program,
};

const DEFAULT_VOLUME: u64 = 50;

fn millis(config: &Config, path: &[&str], default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(config.get_u64_or(path, default)?))
}

/// Optional path: empty means unset, relative paths are relative to the
/// configuration directory.
fn optional_path(config: &Config, path: &[&str]) -> Result<Option<PathBuf>> {
    let value = config.get_string_or(path, "")?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| config.resolve_path(value)))
}

pub trait PlayerConfigExt {
    // ========================================================================
    // Persisted playback state
    // ========================================================================

    fn get_player_volume(&self) -> Result<u8>;
    fn set_player_volume(&self, volume: u8) -> Result<()>;
    fn get_player_muted(&self) -> Result<bool>;
    fn set_player_muted(&self, muted: bool) -> Result<()>;

    // ========================================================================
    // External programs
    // ========================================================================

    fn get_resolver_program(&self) -> Result<PathBuf>;
    fn get_engine_program(&self) -> Result<PathBuf>;
    /// Credentials file handed to the resolver and the engine.
    fn get_cookies_file(&self) -> Result<Option<PathBuf>>;
    fn set_cookies_file(&self, path: &str) -> Result<()>;

    // ========================================================================
    // Timing
    // ========================================================================

    fn get_retry_policy(&self) -> Result<RetryPolicy>;
    fn get_resolve_timeout(&self) -> Result<Duration>;
    fn get_shutdown_budget(&self) -> Result<Duration>;

    fn get_video_domains(&self) -> Result<Vec<String>>;

    /// Everything the controllers need, in one go.
    fn player_settings(&self) -> Result<PlayerSettings>;
}

impl PlayerConfigExt for Config {
    fn get_player_volume(&self) -> Result<u8> {
        let volume = self.get_u64_or(&["player", "volume"], DEFAULT_VOLUME)?;
        Ok(volume.min(100) as u8)
    }

    fn set_player_volume(&self, volume: u8) -> Result<()> {
        self.set_u64(&["player", "volume"], u64::from(volume.min(100)))
    }

    fn get_player_muted(&self) -> Result<bool> {
        self.get_bool_or(&["player", "muted"], false)
    }

    fn set_player_muted(&self, muted: bool) -> Result<()> {
        self.set_bool(&["player", "muted"], muted)
    }

    fn get_resolver_program(&self) -> Result<PathBuf> {
        let configured = self.get_string_or(&["player", "resolver", "path"], "")?;
        Ok(locate_program(&configured, DEFAULT_RESOLVER_NAME))
    }

    fn get_engine_program(&self) -> Result<PathBuf> {
        let configured = self.get_string_or(&["player", "engine", "path"], "")?;
        Ok(locate_program(&configured, DEFAULT_ENGINE_NAME))
    }

    fn get_cookies_file(&self) -> Result<Option<PathBuf>> {
        optional_path(self, &["player", "resolver", "cookies_file"])
    }

    fn set_cookies_file(&self, path: &str) -> Result<()> {
        self.set_string(&["player", "resolver", "cookies_file"], path)
    }

    fn get_retry_policy(&self) -> Result<RetryPolicy> {
        let max_retries = self.get_u64_or(
            &["player", "channel", "max_retries"],
            u64::from(DEFAULT_MAX_RETRIES),
        )?;
        Ok(RetryPolicy {
            max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
            base_delay: millis(self, &["player", "channel", "base_delay_ms"], DEFAULT_BASE_DELAY_MS)?,
            connect_timeout: millis(
                self,
                &["player", "channel", "connect_timeout_ms"],
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?,
        })
    }

    fn get_resolve_timeout(&self) -> Result<Duration> {
        millis(self, &["player", "resolver", "timeout_ms"], DEFAULT_RESOLVE_TIMEOUT_MS)
    }

    fn get_shutdown_budget(&self) -> Result<Duration> {
        millis(self, &["player", "shutdown", "budget_ms"], DEFAULT_SHUTDOWN_BUDGET_MS)
    }

    fn get_video_domains(&self) -> Result<Vec<String>> {
        self.get_string_list_or(&["player", "video_domains"], &DEFAULT_VIDEO_DOMAINS)
    }

    fn player_settings(&self) -> Result<PlayerSettings> {
        let cookies_file = self.get_cookies_file()?;
        let ipc_directory = match optional_path(self, &["player", "engine", "ipc_directory"])? {
            Some(dir) => dir,
            None => std::env::temp_dir(),
        };

        Ok(PlayerSettings {
            resolver: ResolverSettings {
                program: self.get_resolver_program()?,
                cookies_file: cookies_file.clone(),
                timeout: self.get_resolve_timeout()?,
            },
            engine: EngineSettings {
                program: self.get_engine_program()?,
                ipc_prefix: self.get_string_or(&["player", "engine", "ipc_prefix"], DEFAULT_IPC_PREFIX)?,
                ipc_directory,
                endpoint: None,
                restart_delay: millis(
                    self,
                    &["player", "engine", "restart_delay_ms"],
                    DEFAULT_RESTART_DELAY_MS,
                )?,
                cookies_file,
                shutdown_budget: self.get_shutdown_budget()?,
            },
            channel: self.get_retry_policy()?,
            radio_reconnect_delay: millis(
                self,
                &["player", "radio", "reconnect_delay_ms"],
                DEFAULT_RADIO_RECONNECT_DELAY_MS,
            )?,
            video_domains: self.get_video_domains()?,
            initial: PlaybackState {
                is_playing: false,
                volume: self.get_player_volume()?,
                muted: self.get_player_muted()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builds_settings_from_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        let settings = config.player_settings().unwrap();

        assert_eq!(settings.channel, RetryPolicy::default());
        assert_eq!(settings.resolver.timeout, Duration::from_secs(30));
        assert_eq!(settings.engine.shutdown_budget, Duration::from_secs(3));
        assert_eq!(settings.engine.ipc_prefix, "loraradio-mpv");
        assert_eq!(settings.resolver.cookies_file, None);
        assert_eq!(settings.initial.volume, 50);
        assert!(!settings.initial.muted);
    }

    #[test]
    fn persisted_state_and_cookies_are_used() {
        let dir = tempdir().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        config.set_player_volume(150).unwrap();
        config.set_player_muted(true).unwrap();
        config.set_cookies_file("cookies.txt").unwrap();

        let settings = config.player_settings().unwrap();
        assert_eq!(settings.initial.volume, 100);
        assert!(settings.initial.muted);
        assert_eq!(
            settings.engine.cookies_file,
            Some(dir.path().join("cookies.txt"))
        );
        assert_eq!(settings.resolver.cookies_file, settings.engine.cookies_file);
    }
}
