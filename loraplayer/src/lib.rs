//! # loraplayer
//!
//! External-media playback control for LoraRadio.
//!
//! Playback is delegated to two external executables: a resolver turning
//! video-site pages into stream URLs (yt-dlp command line) and a playback
//! engine driven over a JSON IPC socket (mpv). This crate supervises both:
//!
//! - [`ProcessHandle`]: child process with exit tracking and escalating stop
//! - [`resolver`]: URL normalization, resolver runs with timeout and a
//!   single format fallback
//! - [`ControlChannel`]: unix socket / named pipe with bounded reconnection
//! - [`EngineSupervisor`]: engine lifecycle, crash restart, state reapply
//! - [`ShutdownSequencer`]: bounded graceful-then-forced termination
//! - [`PlaybackController`]: the facade, implemented by [`PlayerHandle`] and
//!   [`SwitchPlayer`]
//!
//! ## Example
//!
//! ```no_run
//! use loraplayer::{PlaybackController, PlayerEvent, PlayerSettings, SwitchPlayer};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let player = SwitchPlayer::spawn(&PlayerSettings::default());
//! let events = player.subscribe();
//!
//! player.play("https://www.youtube.com/watch?v=dQw4w9WgXcQ").await;
//! if let Ok(PlayerEvent::ErrorOccurred(message)) = events.recv() {
//!     eprintln!("{message}");
//! }
//! player.shutdown().await;
//! # }
//! ```

pub mod channel;
pub mod config_ext;
pub mod engine;
pub mod errors;
pub mod events;
pub mod model;
pub mod player;
pub mod process;
pub mod resolver;
pub mod settings;
pub mod shutdown;

pub use channel::{ControlChannel, Endpoint, EngineCommand};
pub use config_ext::PlayerConfigExt;
pub use engine::{EngineNotice, EngineSupervisor};
pub use errors::{ChannelError, PlayerError, ResolveError, StartError};
pub use events::PlayerEventBus;
pub use model::{ActiveSource, ConnectionState, EngineProcessState, PlaybackState, PlayerEvent};
pub use player::{PlaybackController, PlayerHandle, PlayerKind, SwitchPlayer};
pub use process::ProcessHandle;
pub use resolver::{PlaybackRequest, ResolvedStream, ResolverClient};
pub use settings::PlayerSettings;
pub use shutdown::{ShutdownPhase, ShutdownSequencer};
