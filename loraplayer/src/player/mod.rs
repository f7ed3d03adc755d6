//! Playback controllers.
//!
//! [`PlaybackController`] is the contract the UI drives. It is implemented by
//! [`PlayerHandle`] (resolver-backed or direct-decode, chosen at construction)
//! and by [`SwitchPlayer`], which routes each URL to one of two backends.

mod control_loop;
mod handle;
mod switch_player;

pub use handle::{PlayerHandle, PlayerKind};
pub use switch_player::{SwitchPlayer, looks_like_video_site};

use async_trait::async_trait;
use crossbeam_channel::Receiver;

use crate::model::PlayerEvent;

/// Playback operations exposed to the UI.
///
/// Commands return once the controller has processed them; results such
/// as the start of playback or failures arrive as [`PlayerEvent`]s.
#[async_trait]
pub trait PlaybackController: Send + Sync {
    /// Starts playing `url`, superseding whatever was playing or resolving.
    async fn play(&self, url: &str);

    /// Stops playback. Idempotent.
    async fn stop(&self);

    /// Pauses or resumes; replays the last URL when stopped.
    async fn toggle_playback(&self);

    /// 0-100; values above are clamped. No-op when unchanged.
    async fn set_volume(&self, volume: u8);

    fn volume(&self) -> u8;

    async fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    fn is_playing(&self) -> bool;

    fn subscribe(&self) -> Receiver<PlayerEvent>;

    /// Stops the external processes. The controller ignores later commands.
    async fn shutdown(&self);
}
