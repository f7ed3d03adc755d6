//! Lifecycle of the playback engine process and its control channel.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelEvent, ChannelNotice, ControlChannel, EndReason, Endpoint, EngineCommand, EngineEvent,
    LoadMode, parse_event,
};
use crate::errors::{ChannelError, PlayerError, StartError};
use crate::model::EngineProcessState;
use crate::process::{ExitInfo, ProcessHandle, SpawnOptions};
use crate::resolver::ResolvedStream;
use crate::settings::{EngineSettings, RetryPolicy};
use crate::shutdown::{ShutdownReport, ShutdownSequencer};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const OBSERVED_PROPERTIES: [(u64, &str); 3] = [(1, "volume"), (2, "mute"), (3, "pause")];

pub enum SupervisorEvent {
    Channel(ChannelEvent),
    ProcessExited(ExitInfo),
    RestartDue(u64),
}

/// What the supervisor reports to the controller owning it.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineNotice {
    Connected,
    /// Channel gave up reconnecting.
    ChannelLost(String),
    FileLoaded,
    FileEnded(EndReason),
    Paused(bool),
    VolumeReported(u8),
    MuteReported(bool),
    /// Abnormal exit; a restart is scheduled.
    Crashed { code: Option<i32> },
    /// Clean exit that nobody asked for.
    Exited { code: Option<i32> },
    Restarted,
    Error(String),
}

pub struct EngineSupervisor {
    settings: EngineSettings,
    endpoint: Endpoint,
    process: Option<ProcessHandle>,
    state: Arc<Mutex<EngineProcessState>>,
    channel: ControlChannel,
    volume: u8,
    muted: bool,
    shutting_down: bool,
    /// Set between `start`/`reconnect` and the first connect outcome.
    first_connect_pending: bool,
    restart_generation: u64,
    restarts_tx: UnboundedSender<u64>,
    restarts_rx: UnboundedReceiver<u64>,
}

impl EngineSupervisor {
    pub fn new(settings: EngineSettings, policy: RetryPolicy, volume: u8, muted: bool) -> Self {
        let endpoint = settings.endpoint();
        let (restarts_tx, restarts_rx) = unbounded_channel();
        Self {
            channel: ControlChannel::new(endpoint.clone(), policy),
            settings,
            endpoint,
            process: None,
            state: Arc::new(Mutex::new(EngineProcessState::default())),
            volume: volume.min(100),
            muted,
            shutting_down: false,
            first_connect_pending: false,
            restart_generation: 0,
            restarts_tx,
            restarts_rx,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shared, read-only view of the process state.
    pub fn state_handle(&self) -> Arc<Mutex<EngineProcessState>> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| !p.has_exited())
    }

    /// True until the channel opened by `start` or `reconnect` either
    /// connects or gives up. Drops later on do not count.
    pub fn awaiting_connection(&self) -> bool {
        self.first_connect_pending
    }

    pub fn channel_exhausted(&self) -> bool {
        self.channel.is_exhausted()
    }

    /// Starts a fresh connection cycle after the channel gave up.
    pub fn reconnect(&mut self) {
        if !self.is_running() {
            return;
        }
        info!(endpoint = %self.endpoint, "Reconnecting to playback engine");
        self.first_connect_pending = true;
        self.channel.connect();
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn engine_args(&self) -> Vec<String> {
        vec![
            "--idle=yes".to_string(),
            "--no-video".to_string(),
            "--no-terminal".to_string(),
            "--ytdl=no".to_string(),
            self.endpoint.engine_arg(),
        ]
    }

    /// Launches the engine if it is not running and starts connecting.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.is_running() {
            return Ok(());
        }
        self.shutting_down = false;

        let options = SpawnOptions {
            new_process_group: true,
        };
        let mut process =
            ProcessHandle::start_with(&self.settings.program, &self.engine_args(), options)?;
        process.forward_output("engine");
        let pid = process.id();
        info!(pid = ?pid, endpoint = %self.endpoint, "Playback engine started");

        *self.state.lock() = EngineProcessState { running: true, pid };
        self.process = Some(process);
        self.first_connect_pending = true;
        self.channel.connect();
        Ok(())
    }

    /// Next event from the process, the channel or a restart timer.
    pub async fn next_event(&mut self) -> SupervisorEvent {
        tokio::select! {
            event = self.channel.next_event() => SupervisorEvent::Channel(event),
            exit = wait_exit(self.process.as_mut()) => SupervisorEvent::ProcessExited(exit),
            Some(generation) = self.restarts_rx.recv() => SupervisorEvent::RestartDue(generation),
        }
    }

    pub async fn handle_event(&mut self, event: SupervisorEvent) -> Vec<EngineNotice> {
        match event {
            SupervisorEvent::Channel(event) => match self.channel.handle_event(event) {
                Some(notice) => self.on_channel_notice(notice).await,
                None => Vec::new(),
            },
            SupervisorEvent::ProcessExited(exit) => self.on_exit(exit),
            SupervisorEvent::RestartDue(generation) => {
                if generation != self.restart_generation || self.shutting_down {
                    return Vec::new();
                }
                info!("Restarting playback engine");
                match self.start() {
                    Ok(()) => vec![EngineNotice::Restarted],
                    Err(err) => {
                        error!("Engine restart failed: {}", err);
                        vec![EngineNotice::Error(err.to_string())]
                    }
                }
            }
        }
    }

    async fn on_channel_notice(&mut self, notice: ChannelNotice) -> Vec<EngineNotice> {
        match notice {
            ChannelNotice::Connected => {
                self.first_connect_pending = false;
                self.on_connected().await;
                vec![EngineNotice::Connected]
            }
            ChannelNotice::Disconnected { retrying } => {
                debug!(retrying, "Engine channel disconnected");
                Vec::new()
            }
            ChannelNotice::RetriesExhausted(err) => {
                self.first_connect_pending = false;
                vec![EngineNotice::ChannelLost(err.to_string())]
            }
            ChannelNotice::Message(raw) => match parse_event(&raw) {
                Some(event) => self.on_engine_event(event),
                None => {
                    debug!(line = %raw, "Ignoring unparsable engine message");
                    Vec::new()
                }
            },
        }
    }

    /// Reapplies mirrored state and subscribes to property changes.
    async fn on_connected(&mut self) {
        let mut commands = vec![
            EngineCommand::set_property("volume", self.volume),
            EngineCommand::set_property("mute", self.muted),
        ];
        commands.extend(
            OBSERVED_PROPERTIES
                .iter()
                .map(|(id, name)| EngineCommand::observe_property(*id, name)),
        );
        for command in &commands {
            if let Err(err) = self.channel.send(command).await {
                warn!("Failed to initialise engine state: {}", err);
                break;
            }
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) -> Vec<EngineNotice> {
        match event {
            EngineEvent::FileLoaded => vec![EngineNotice::FileLoaded],
            EngineEvent::EndFile(reason) => vec![EngineNotice::FileEnded(reason)],
            EngineEvent::PropertyChange { name, data } => self.on_property_change(&name, &data),
            EngineEvent::Reply { error } if error != "success" => {
                warn!(error = %error, "Engine rejected a command");
                Vec::new()
            }
            EngineEvent::Shutdown => {
                debug!("Engine is shutting down");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_property_change(&mut self, name: &str, data: &Value) -> Vec<EngineNotice> {
        match name {
            "volume" => {
                let Some(volume) = data.as_f64() else {
                    return Vec::new();
                };
                let volume = volume.round().clamp(0.0, 100.0) as u8;
                if volume == self.volume {
                    return Vec::new();
                }
                self.volume = volume;
                vec![EngineNotice::VolumeReported(volume)]
            }
            "mute" => match data.as_bool() {
                Some(muted) if muted != self.muted => {
                    self.muted = muted;
                    vec![EngineNotice::MuteReported(muted)]
                }
                _ => Vec::new(),
            },
            "pause" => data
                .as_bool()
                .map(|paused| vec![EngineNotice::Paused(paused)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn on_exit(&mut self, exit: ExitInfo) -> Vec<EngineNotice> {
        *self.state.lock() = EngineProcessState::default();
        self.process = None;
        self.first_connect_pending = false;
        self.channel.close();

        if self.shutting_down {
            debug!(code = ?exit.code, "Engine exited during shutdown");
            return Vec::new();
        }

        if exit.crashed {
            warn!(
                code = ?exit.code,
                delay = ?self.settings.restart_delay,
                "Playback engine crashed, scheduling restart"
            );
            self.restart_generation += 1;
            let generation = self.restart_generation;
            let delay = self.settings.restart_delay;
            let restarts = self.restarts_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = restarts.send(generation);
            });
            vec![EngineNotice::Crashed { code: exit.code }]
        } else {
            warn!(code = ?exit.code, "Playback engine exited");
            vec![EngineNotice::Exited { code: exit.code }]
        }
    }

    /// Hands a resolved stream to the engine.
    ///
    /// The first URL replaces the current playback, the others are
    /// appended in order. Fails if the replace command cannot be sent.
    pub async fn load_resolved(&mut self, stream: &ResolvedStream) -> Result<(), PlayerError> {
        let headers = match &stream.referer {
            Some(referer) => format!("Referer: {referer},User-Agent: {USER_AGENT}"),
            None => String::new(),
        };
        self.send_optional(EngineCommand::set_property("http-header-fields", headers))
            .await;
        if let Some(cookies) = &self.settings.cookies_file {
            let cookies = cookies.to_string_lossy().into_owned();
            self.send_optional(EngineCommand::set_property("cookies", true))
                .await;
            self.send_optional(EngineCommand::set_property("cookies-file", cookies))
                .await;
        }

        info!(url = %stream.primary_url, "Loading stream");
        self.channel
            .send(&EngineCommand::load_file(&stream.primary_url, LoadMode::Replace))
            .await?;

        for url in &stream.additional_urls {
            if let Err(err) = self
                .channel
                .send(&EngineCommand::load_file(url, LoadMode::AppendPlay))
                .await
            {
                warn!(url = %url, "Failed to append stream: {}", err);
            }
        }
        Ok(())
    }

    async fn send_optional(&mut self, command: EngineCommand) {
        if let Err(err) = self.channel.send(&command).await {
            debug!(command = command.name(), "Optional command not sent: {}", err);
        }
    }

    pub async fn stop_playback(&mut self) -> Result<(), ChannelError> {
        self.channel.send(&EngineCommand::stop()).await
    }

    pub async fn toggle_pause(&mut self) -> Result<(), ChannelError> {
        self.channel.send(&EngineCommand::cycle("pause")).await
    }

    /// Returns `false` when `volume` is already the mirrored value.
    pub async fn set_volume(&mut self, volume: u8) -> bool {
        let volume = volume.min(100);
        if volume == self.volume {
            return false;
        }
        self.volume = volume;
        let _ = self
            .channel
            .send(&EngineCommand::set_property("volume", volume))
            .await;
        true
    }

    /// Returns `false` when `muted` is already the mirrored value.
    pub async fn set_muted(&mut self, muted: bool) -> bool {
        if muted == self.muted {
            return false;
        }
        self.muted = muted;
        let _ = self
            .channel
            .send(&EngineCommand::set_property("mute", muted))
            .await;
        true
    }

    /// Runs the shutdown sequence; the engine is not restarted afterwards.
    pub async fn shutdown(&mut self) -> Option<ShutdownReport> {
        self.shutting_down = true;
        self.restart_generation += 1;

        let report = match self.process.as_mut() {
            Some(process) => {
                let sequencer = ShutdownSequencer::new(self.settings.shutdown_budget);
                let report = sequencer.run(&mut self.channel, process).await;
                info!(phase = ?report.phase, elapsed = ?report.elapsed, "Playback engine stopped");
                Some(report)
            }
            None => None,
        };

        self.channel.close();
        self.process = None;
        self.first_connect_pending = false;
        *self.state.lock() = EngineProcessState::default();
        report
    }
}

async fn wait_exit(process: Option<&mut ProcessHandle>) -> ExitInfo {
    match process {
        Some(process) if !process.has_exited() => process.wait().await,
        _ => std::future::pending().await,
    }
}
