use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tracing::debug;

use super::PlaybackController;
use super::control_loop::{Envelope, PlayerCommand, PlayerCore, SourceBackend};
use crate::channel::Endpoint;
use crate::engine::EngineSupervisor;
use crate::events::PlayerEventBus;
use crate::model::{EngineProcessState, PlaybackState, PlayerEvent};
use crate::resolver::ResolverClient;
use crate::settings::PlayerSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerKind {
    /// Resolver plus engine.
    Stream,
    /// Plain stream URLs decoded by the engine.
    Radio,
}

/// Handle on a running engine-backed controller.
///
/// Cloning is cheap. The controller shuts its engine down once every
/// handle is gone.
#[derive(Clone)]
pub struct PlayerHandle {
    kind: PlayerKind,
    commands: UnboundedSender<Envelope>,
    bus: PlayerEventBus,
    state: Arc<Mutex<PlaybackState>>,
    engine_state: Arc<Mutex<EngineProcessState>>,
    endpoint: Endpoint,
}

impl PlayerHandle {
    /// Resolver-backed controller. Must be called within a tokio runtime.
    pub fn stream_player(settings: &PlayerSettings) -> Self {
        let source = SourceBackend::Resolver(ResolverClient::new(settings.resolver.clone()));
        Self::spawn(PlayerKind::Stream, source, settings)
    }

    /// Direct-decode controller for plain radio streams. Must be called
    /// within a tokio runtime.
    pub fn radio_player(settings: &PlayerSettings) -> Self {
        let source = SourceBackend::Direct {
            reconnect_delay: settings.radio_reconnect_delay,
            max_reconnects: settings.channel.max_retries,
        };
        Self::spawn(PlayerKind::Radio, source, settings)
    }

    fn spawn(kind: PlayerKind, source: SourceBackend, settings: &PlayerSettings) -> Self {
        let label = match kind {
            PlayerKind::Stream => "stream",
            PlayerKind::Radio => "radio",
        };
        let engine = EngineSupervisor::new(
            settings.engine.clone(),
            settings.channel,
            settings.initial.volume,
            settings.initial.muted,
        );
        let endpoint = engine.endpoint().clone();
        let engine_state = engine.state_handle();
        let state = Arc::new(Mutex::new(PlaybackState {
            is_playing: false,
            volume: settings.initial.volume.min(100),
            muted: settings.initial.muted,
        }));
        let bus = PlayerEventBus::new();

        let core = PlayerCore::new(label, source, engine, bus.clone(), state.clone());
        let (commands, receiver) = unbounded_channel();
        tokio::spawn(core.run(receiver));

        Self {
            kind,
            commands,
            bus,
            state,
            engine_state,
            endpoint,
        }
    }

    pub fn kind(&self) -> PlayerKind {
        self.kind
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    pub fn engine_state(&self) -> EngineProcessState {
        *self.engine_state.lock()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Posts `command` and waits until the control loop has handled it.
    async fn request(&self, command: PlayerCommand) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Envelope { command, ack }).is_err() {
            debug!(kind = ?self.kind, "Controller is gone, command ignored");
            return;
        }
        let _ = done.await;
    }
}

#[async_trait]
impl PlaybackController for PlayerHandle {
    async fn play(&self, url: &str) {
        self.request(PlayerCommand::Play(url.to_string())).await;
    }

    async fn stop(&self) {
        self.request(PlayerCommand::Stop).await;
    }

    async fn toggle_playback(&self) {
        self.request(PlayerCommand::Toggle).await;
    }

    async fn set_volume(&self, volume: u8) {
        self.request(PlayerCommand::SetVolume(volume)).await;
    }

    fn volume(&self) -> u8 {
        self.state.lock().volume
    }

    async fn set_muted(&self, muted: bool) {
        self.request(PlayerCommand::SetMuted(muted)).await;
    }

    fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    fn is_playing(&self) -> bool {
        self.state.lock().is_playing
    }

    fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.bus.subscribe()
    }

    async fn shutdown(&self) {
        self.request(PlayerCommand::Shutdown).await;
    }
}
