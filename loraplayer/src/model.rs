/// Facade-visible playback state.
///
/// Written only by the owning controller loop; handles read a shared copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackState {
    pub is_playing: bool,
    /// 0-100
    pub volume: u8,
    pub muted: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            volume: 50,
            muted: false,
        }
    }
}

/// Supervisor view of the engine process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineProcessState {
    pub running: bool,
    pub pid: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayerEvent {
    PlaybackStateChanged(bool),
    VolumeChanged(u8),
    MutedChanged(bool),
    ErrorOccurred(String),
}

/// Backend currently driven by the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActiveSource {
    #[default]
    Radio,
    Stream,
}
