//! Control loop shared by the engine-backed players.
//!
//! One task owns the supervisor, the resolver and the playback state.
//! Handles talk to it through [`Envelope`]s; every other source of change
//! (engine events, resolver outcomes, timers) is a message on one of the
//! queues it selects over.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::channel::EndReason;
use crate::engine::{EngineNotice, EngineSupervisor};
use crate::errors::PlayerError;
use crate::events::PlayerEventBus;
use crate::model::{PlaybackState, PlayerEvent};
use crate::resolver::{PlaybackRequest, ResolveOutcome, ResolvedStream, ResolverClient};

#[derive(Debug)]
pub(crate) enum PlayerCommand {
    Play(String),
    Stop,
    Toggle,
    SetVolume(u8),
    SetMuted(bool),
    Shutdown,
}

pub(crate) struct Envelope {
    pub command: PlayerCommand,
    pub ack: oneshot::Sender<()>,
}

/// Where playable URLs come from.
pub(crate) enum SourceBackend {
    /// Page URLs resolved by the external resolver.
    Resolver(ResolverClient),
    /// Plain stream URLs, reloaded after a stall.
    Direct {
        reconnect_delay: Duration,
        max_reconnects: u32,
    },
}

pub(crate) struct PlayerCore {
    label: &'static str,
    source: SourceBackend,
    engine: EngineSupervisor,
    bus: PlayerEventBus,
    state: Arc<Mutex<PlaybackState>>,
    generation: u64,
    last_request: Option<PlaybackRequest>,
    /// Resolution or load under way.
    pending: bool,
    /// Stream waiting for the control channel to come up.
    deferred: Option<ResolvedStream>,
    /// The engine holds a file.
    loaded: bool,
    user_stopped: bool,
    reconnects: u32,
    reconnect_scheduled: bool,
    outcomes_tx: UnboundedSender<ResolveOutcome>,
    outcomes_rx: UnboundedReceiver<ResolveOutcome>,
    reconnect_tx: UnboundedSender<u64>,
    reconnect_rx: UnboundedReceiver<u64>,
}

impl PlayerCore {
    pub(crate) fn new(
        label: &'static str,
        source: SourceBackend,
        engine: EngineSupervisor,
        bus: PlayerEventBus,
        state: Arc<Mutex<PlaybackState>>,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = unbounded_channel();
        let (reconnect_tx, reconnect_rx) = unbounded_channel();
        Self {
            label,
            source,
            engine,
            bus,
            state,
            generation: 0,
            last_request: None,
            pending: false,
            deferred: None,
            loaded: false,
            user_stopped: false,
            reconnects: 0,
            reconnect_scheduled: false,
            outcomes_tx,
            outcomes_rx,
            reconnect_tx,
            reconnect_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: UnboundedReceiver<Envelope>) {
        if let Err(err) = self.engine.start() {
            self.report_error(err.into());
        }

        loop {
            tokio::select! {
                envelope = commands.recv() => {
                    let Some(Envelope { command, ack }) = envelope else {
                        debug!(player = self.label, "All handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    let last = matches!(command, PlayerCommand::Shutdown);
                    self.handle_command(command).await;
                    let _ = ack.send(());
                    if last {
                        break;
                    }
                }
                event = self.engine.next_event() => {
                    for notice in self.engine.handle_event(event).await {
                        self.on_engine_notice(notice).await;
                    }
                }
                Some(outcome) = self.outcomes_rx.recv() => self.on_resolved(outcome).await,
                Some(generation) = self.reconnect_rx.recv() => self.on_reconnect_due(generation).await,
            }
        }
        debug!(player = self.label, "Controller loop finished");
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        debug!(player = self.label, ?command, "Handling command");
        match command {
            PlayerCommand::Play(url) => self.play(&url).await,
            PlayerCommand::Stop => self.stop().await,
            PlayerCommand::Toggle => self.toggle().await,
            PlayerCommand::SetVolume(volume) => {
                if self.engine.set_volume(volume).await {
                    self.publish_volume(self.engine.volume());
                }
            }
            PlayerCommand::SetMuted(muted) => {
                if self.engine.set_muted(muted).await {
                    self.publish_muted(muted);
                }
            }
            PlayerCommand::Shutdown => self.shutdown().await,
        }
    }

    fn is_playing(&self) -> bool {
        self.state.lock().is_playing
    }

    fn set_playing(&self, playing: bool) {
        {
            let mut state = self.state.lock();
            if state.is_playing == playing {
                return;
            }
            state.is_playing = playing;
        }
        self.bus.broadcast(PlayerEvent::PlaybackStateChanged(playing));
    }

    fn publish_volume(&self, volume: u8) {
        {
            let mut state = self.state.lock();
            if state.volume == volume {
                return;
            }
            state.volume = volume;
        }
        self.bus.broadcast(PlayerEvent::VolumeChanged(volume));
    }

    fn publish_muted(&self, muted: bool) {
        {
            let mut state = self.state.lock();
            if state.muted == muted {
                return;
            }
            state.muted = muted;
        }
        self.bus.broadcast(PlayerEvent::MutedChanged(muted));
    }

    fn report(&self, message: String) {
        error!(player = self.label, "{}", message);
        self.bus.broadcast(PlayerEvent::ErrorOccurred(message));
    }

    fn report_error(&self, err: PlayerError) {
        self.report(err.to_string());
    }

    async fn play(&mut self, url: &str) {
        if url.trim().is_empty() {
            self.report_error(PlayerError::EmptyUrl);
            return;
        }

        self.generation += 1;
        self.user_stopped = false;
        self.reconnects = 0;
        self.reconnect_scheduled = false;
        self.deferred = None;
        self.pending = true;

        let request = match self.source {
            SourceBackend::Resolver(_) => PlaybackRequest::new(url),
            SourceBackend::Direct { .. } => PlaybackRequest::direct(url),
        };
        info!(player = self.label, url = %request.normalized_url(), "Play requested");
        self.last_request = Some(request.clone());

        if let SourceBackend::Resolver(client) = &mut self.source {
            client.begin(request, self.generation, self.outcomes_tx.clone());
        } else {
            self.load(ResolvedStream::direct(request.normalized_url()))
                .await;
        }
    }

    async fn load(&mut self, stream: ResolvedStream) {
        if !self.engine.is_running() {
            if let Err(err) = self.engine.start() {
                self.pending = false;
                self.report_error(err.into());
                return;
            }
        }

        if self.engine.channel_exhausted() {
            self.engine.reconnect();
        }

        if self.engine.awaiting_connection() {
            debug!(player = self.label, "Engine channel not ready, deferring load");
            self.deferred = Some(stream);
            return;
        }

        match self.engine.load_resolved(&stream).await {
            Ok(()) => {
                self.pending = false;
                self.loaded = true;
                self.set_playing(true);
            }
            Err(err) => {
                self.pending = false;
                self.report_error(err);
            }
        }
    }

    async fn on_resolved(&mut self, outcome: ResolveOutcome) {
        if outcome.generation != self.generation {
            debug!(
                player = self.label,
                url = %outcome.request.normalized_url(),
                "Discarding superseded resolution"
            );
            return;
        }
        match outcome.result {
            Ok(stream) => self.load(stream).await,
            Err(err) => {
                self.pending = false;
                self.report_error(err.into());
            }
        }
    }

    async fn stop(&mut self) {
        self.generation += 1;
        self.user_stopped = true;
        self.deferred = None;
        self.reconnect_scheduled = false;
        if let SourceBackend::Resolver(client) = &mut self.source {
            client.cancel();
        }

        let was_active = self.pending || self.is_playing();
        if self.loaded || was_active {
            if let Err(err) = self.engine.stop_playback().await {
                debug!(player = self.label, "Stop not delivered: {}", err);
            }
        }
        self.pending = false;
        self.loaded = false;

        if was_active {
            self.state.lock().is_playing = false;
            self.bus.broadcast(PlayerEvent::PlaybackStateChanged(false));
        }
    }

    async fn toggle(&mut self) {
        if self.loaded {
            match self.engine.toggle_pause().await {
                Ok(()) => self.set_playing(!self.is_playing()),
                Err(err) => debug!(player = self.label, "Toggle not delivered: {}", err),
            }
            return;
        }
        if self.pending {
            return;
        }
        if let Some(request) = self.last_request.clone() {
            self.play(request.raw_url()).await;
        }
    }

    async fn shutdown(&mut self) {
        self.generation += 1;
        self.user_stopped = true;
        self.deferred = None;
        if let SourceBackend::Resolver(client) = &mut self.source {
            client.cancel();
        }
        self.engine.shutdown().await;
        self.pending = false;
        self.loaded = false;
        self.set_playing(false);
    }

    async fn on_engine_notice(&mut self, notice: EngineNotice) {
        match notice {
            EngineNotice::Connected => {
                if let Some(stream) = self.deferred.take() {
                    self.load(stream).await;
                }
            }
            EngineNotice::ChannelLost(message) => {
                self.deferred = None;
                self.pending = false;
                self.loaded = false;
                self.set_playing(false);
                self.report(format!("Playback engine unreachable: {message}"));
            }
            EngineNotice::FileLoaded => {
                self.loaded = true;
                self.pending = false;
                self.reconnects = 0;
                self.set_playing(true);
            }
            EngineNotice::FileEnded(reason) => self.on_file_ended(reason),
            EngineNotice::Paused(paused) => {
                if self.loaded {
                    self.set_playing(!paused);
                }
            }
            EngineNotice::VolumeReported(volume) => self.publish_volume(volume),
            EngineNotice::MuteReported(muted) => self.publish_muted(muted),
            EngineNotice::Crashed { code } => {
                warn!(player = self.label, code = ?code, "Engine crashed");
                self.loaded = false;
                self.set_playing(false);
                self.schedule_reconnect();
            }
            EngineNotice::Exited { code } => {
                self.loaded = false;
                self.pending = false;
                self.set_playing(false);
                self.report_error(PlayerError::EngineExited { code });
            }
            EngineNotice::Restarted => debug!(player = self.label, "Engine restarted"),
            EngineNotice::Error(message) => self.report(message),
        }
    }

    fn on_file_ended(&mut self, reason: EndReason) {
        match reason {
            // replaced by the next load, or followed by the redirect target
            EndReason::Stop | EndReason::Redirect => {}
            EndReason::Eof | EndReason::Quit | EndReason::Unknown => {
                self.loaded = false;
                self.set_playing(false);
                if reason == EndReason::Eof && !self.schedule_reconnect() && self.is_direct() {
                    self.report("Stream ended and could not be resumed".to_string());
                }
            }
            EndReason::Error(message) => {
                self.loaded = false;
                self.pending = false;
                self.set_playing(false);
                if self.is_direct() && self.schedule_reconnect() {
                    warn!(player = self.label, "Stream failed ({}), reconnecting", message);
                } else {
                    self.report_error(PlayerError::playback(message));
                }
            }
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self.source, SourceBackend::Direct { .. })
    }

    /// Schedules a reload of the current radio stream.
    fn schedule_reconnect(&mut self) -> bool {
        let SourceBackend::Direct {
            reconnect_delay,
            max_reconnects,
        } = self.source
        else {
            return false;
        };
        if self.user_stopped || self.last_request.is_none() {
            return false;
        }
        if self.reconnect_scheduled {
            return true;
        }
        if self.reconnects >= max_reconnects {
            warn!(player = self.label, attempts = self.reconnects, "Giving up reconnecting");
            return false;
        }

        self.reconnects += 1;
        self.reconnect_scheduled = true;
        let generation = self.generation;
        let reconnect = self.reconnect_tx.clone();
        info!(
            player = self.label,
            attempt = self.reconnects,
            delay = ?reconnect_delay,
            "Scheduling stream reconnect"
        );
        tokio::spawn(async move {
            tokio::time::sleep(reconnect_delay).await;
            let _ = reconnect.send(generation);
        });
        true
    }

    async fn on_reconnect_due(&mut self, generation: u64) {
        if generation != self.generation || self.user_stopped || !self.reconnect_scheduled {
            return;
        }
        self.reconnect_scheduled = false;
        if let Some(request) = self.last_request.clone() {
            info!(player = self.label, url = %request.normalized_url(), "Reconnecting stream");
            self.pending = true;
            self.load(ResolvedStream::direct(request.normalized_url()))
                .await;
        }
    }
}
