use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::PlaybackController;
use super::handle::PlayerHandle;
use crate::events::PlayerEventBus;
use crate::model::{ActiveSource, PlayerEvent};
use crate::resolver::is_short_id;
use crate::settings::PlayerSettings;

/// Whether `url` should go through the resolver: a configured video-site
/// domain marker, or a bare short video id.
pub fn looks_like_video_site(url: &str, domains: &[String]) -> bool {
    let url = url.trim();
    is_short_id(url)
        || domains
            .iter()
            .any(|domain| !domain.is_empty() && url.contains(domain.as_str()))
}

/// Dispatcher over a radio backend and a video-site backend.
///
/// Events are proxied from the active backend only; the radio backend is
/// considered active until something else was played.
pub struct SwitchPlayer {
    radio: Arc<dyn PlaybackController>,
    stream: Arc<dyn PlaybackController>,
    active: Arc<Mutex<ActiveSource>>,
    bus: PlayerEventBus,
    video_domains: Vec<String>,
}

impl SwitchPlayer {
    /// Spawns both engine-backed players. Must be called within a tokio
    /// runtime.
    pub fn spawn(settings: &PlayerSettings) -> Self {
        let radio = PlayerHandle::radio_player(settings);
        let stream = PlayerHandle::stream_player(settings);
        Self::new(
            Arc::new(radio),
            Arc::new(stream),
            settings.video_domains.clone(),
        )
    }

    pub fn new(
        radio: Arc<dyn PlaybackController>,
        stream: Arc<dyn PlaybackController>,
        video_domains: Vec<String>,
    ) -> Self {
        let active = Arc::new(Mutex::new(ActiveSource::default()));
        let bus = PlayerEventBus::new();

        forward_events(ActiveSource::Radio, radio.subscribe(), active.clone(), bus.clone());
        forward_events(ActiveSource::Stream, stream.subscribe(), active.clone(), bus.clone());

        Self {
            radio,
            stream,
            active,
            bus,
            video_domains,
        }
    }

    pub fn active_source(&self) -> ActiveSource {
        *self.active.lock()
    }

    fn backend(&self, source: ActiveSource) -> &Arc<dyn PlaybackController> {
        match source {
            ActiveSource::Radio => &self.radio,
            ActiveSource::Stream => &self.stream,
        }
    }

    fn current(&self) -> &Arc<dyn PlaybackController> {
        self.backend(self.active_source())
    }
}

fn forward_events(
    source: ActiveSource,
    events: Receiver<PlayerEvent>,
    active: Arc<Mutex<ActiveSource>>,
    bus: PlayerEventBus,
) {
    let name = format!("switch-forward-{source:?}").to_lowercase();
    let spawned = thread::Builder::new().name(name).spawn(move || {
        while let Ok(event) = events.recv() {
            if *active.lock() == source {
                bus.broadcast(event);
            } else {
                debug!(?source, ?event, "Dropping event from inactive backend");
            }
        }
        debug!(?source, "Backend event stream closed");
    });
    if let Err(err) = spawned {
        warn!(?source, "Failed to spawn event forwarder: {}", err);
    }
}

#[async_trait]
impl PlaybackController for SwitchPlayer {
    async fn play(&self, url: &str) {
        let target = if looks_like_video_site(url, &self.video_domains) {
            ActiveSource::Stream
        } else {
            ActiveSource::Radio
        };
        let other = match target {
            ActiveSource::Radio => ActiveSource::Stream,
            ActiveSource::Stream => ActiveSource::Radio,
        };
        info!(?target, url = %url.trim(), "Dispatching playback");

        self.backend(other).stop().await;
        *self.active.lock() = target;
        self.backend(target).play(url).await;
    }

    async fn stop(&self) {
        tokio::join!(self.radio.stop(), self.stream.stop());
    }

    async fn toggle_playback(&self) {
        self.current().toggle_playback().await;
    }

    async fn set_volume(&self, volume: u8) {
        tokio::join!(self.radio.set_volume(volume), self.stream.set_volume(volume));
    }

    fn volume(&self) -> u8 {
        self.current().volume()
    }

    async fn set_muted(&self, muted: bool) {
        tokio::join!(self.radio.set_muted(muted), self.stream.set_muted(muted));
    }

    fn is_muted(&self) -> bool {
        self.current().is_muted()
    }

    fn is_playing(&self) -> bool {
        self.current().is_playing()
    }

    fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.bus.subscribe()
    }

    async fn shutdown(&self) {
        tokio::join!(self.radio.shutdown(), self.stream.shutdown());
    }
}
