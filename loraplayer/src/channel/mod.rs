//! Duplex control channel to the playback engine.
//!
//! The channel never blocks its owner: connection attempts, socket reads and
//! reconnect timers run as tasks that post [`ChannelEvent`]s back. The owner
//! pulls them with [`ControlChannel::next_event`] and feeds them to
//! [`ControlChannel::handle_event`], which updates the state machine and
//! returns what the owner should know about.

mod endpoint;
mod protocol;

pub use endpoint::Endpoint;
pub use protocol::{EndReason, EngineCommand, EngineEvent, LoadMode, parse_event};

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::errors::ChannelError;
use crate::model::ConnectionState;
use crate::settings::RetryPolicy;
use endpoint::{IpcStream, open_stream};

type Writer = WriteHalf<Box<dyn IpcStream>>;

/// Internal progress of the channel, produced by its background tasks.
pub enum ChannelEvent {
    ConnectFinished {
        epoch: u64,
        result: std::io::Result<Box<dyn IpcStream>>,
    },
    Line {
        epoch: u64,
        raw: String,
    },
    ReaderClosed {
        epoch: u64,
    },
    RetryDue {
        epoch: u64,
    },
}

/// What the owner of the channel is told.
#[derive(Debug)]
pub enum ChannelNotice {
    Connected,
    Disconnected { retrying: bool },
    Message(String),
    /// Terminal: no more automatic attempts until `connect()`.
    RetriesExhausted(ChannelError),
}

pub struct ControlChannel {
    endpoint: Endpoint,
    policy: RetryPolicy,
    state: ConnectionState,
    retry_count: u32,
    attempts: u32,
    epoch: u64,
    shutting_down: bool,
    /// Reconnection gave up; only `connect()` starts over.
    exhausted: bool,
    writer: Option<Writer>,
    reader: Option<JoinHandle<()>>,
    events_tx: UnboundedSender<ChannelEvent>,
    events_rx: UnboundedReceiver<ChannelEvent>,
}

impl ControlChannel {
    pub fn new(endpoint: Endpoint, policy: RetryPolicy) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            endpoint,
            policy,
            state: ConnectionState::Disconnected,
            retry_count: 0,
            attempts: 0,
            epoch: 0,
            shutting_down: false,
            exhausted: false,
            writer: None,
            reader: None,
            events_tx,
            events_rx,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.writer.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Connection attempts made since creation.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set_shutting_down(&mut self, shutting_down: bool) {
        self.shutting_down = shutting_down;
    }

    /// Starts connecting, resetting the retry budget.
    pub fn connect(&mut self) {
        self.close();
        self.shutting_down = false;
        self.exhausted = false;
        self.retry_count = 0;
        self.attempt();
    }

    /// Drops the connection and stale background work, without reconnecting.
    pub fn close(&mut self) {
        self.epoch += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.state = ConnectionState::Disconnected;
    }

    fn attempt(&mut self) {
        self.state = ConnectionState::Connecting;
        self.attempts += 1;

        let epoch = self.epoch;
        let endpoint = self.endpoint.clone();
        let timeout = self.policy.connect_timeout;
        let events = self.events_tx.clone();
        debug!(endpoint = %endpoint, attempt = self.attempts, "Connecting to engine");

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, open_stream(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            };
            let _ = events.send(ChannelEvent::ConnectFinished { epoch, result });
        });
    }

    /// Next background event. Never resolves while the channel is idle.
    pub async fn next_event(&mut self) -> ChannelEvent {
        match self.events_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    pub fn handle_event(&mut self, event: ChannelEvent) -> Option<ChannelNotice> {
        match event {
            ChannelEvent::ConnectFinished { epoch, result } if epoch == self.epoch => {
                match result {
                    Ok(stream) => Some(self.install(stream)),
                    Err(err) => {
                        debug!(endpoint = %self.endpoint, "Connection attempt failed: {}", err);
                        self.state = ConnectionState::Disconnected;
                        self.schedule_retry()
                            .err()
                            .map(ChannelNotice::RetriesExhausted)
                    }
                }
            }
            ChannelEvent::Line { epoch, raw } if epoch == self.epoch => {
                trace!(line = %raw, "Engine message");
                Some(ChannelNotice::Message(raw))
            }
            ChannelEvent::ReaderClosed { epoch } if epoch == self.epoch => {
                warn!(endpoint = %self.endpoint, "Control channel disconnected");
                self.writer = None;
                self.reader = None;
                self.state = ConnectionState::Disconnected;
                match self.schedule_retry() {
                    Ok(retrying) => Some(ChannelNotice::Disconnected { retrying }),
                    Err(err) => Some(ChannelNotice::RetriesExhausted(err)),
                }
            }
            ChannelEvent::RetryDue { epoch }
                if epoch == self.epoch
                    && self.state == ConnectionState::Disconnected
                    && !self.shutting_down =>
            {
                self.attempt();
                None
            }
            _ => None,
        }
    }

    fn install(&mut self, stream: Box<dyn IpcStream>) -> ChannelNotice {
        let (read_half, write_half) = tokio::io::split(stream);
        let epoch = self.epoch;
        let events = self.events_tx.clone();

        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(raw)) => {
                        if events.send(ChannelEvent::Line { epoch, raw }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("Control channel read error: {}", err);
                        break;
                    }
                }
            }
            let _ = events.send(ChannelEvent::ReaderClosed { epoch });
        }));
        self.writer = Some(write_half);
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        info!(endpoint = %self.endpoint, "Control channel connected");
        ChannelNotice::Connected
    }

    /// `Ok(true)` when a reconnect was scheduled, `Ok(false)` while shutting
    /// down, `Err` once the retry budget is spent.
    fn schedule_retry(&mut self) -> Result<bool, ChannelError> {
        if self.shutting_down {
            return Ok(false);
        }
        if self.retry_count >= self.policy.max_retries {
            warn!(
                endpoint = %self.endpoint,
                attempts = self.attempts,
                "Giving up on control channel"
            );
            self.exhausted = true;
            return Err(ChannelError::ConnectFailed {
                endpoint: self.endpoint.to_string(),
                attempts: self.attempts,
            });
        }

        self.retry_count += 1;
        let delay = self.policy.base_delay * self.retry_count;
        let epoch = self.epoch;
        let events = self.events_tx.clone();
        debug!(retry = self.retry_count, delay = ?delay, "Scheduling reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ChannelEvent::RetryDue { epoch });
        });
        Ok(true)
    }

    /// Sends a command if connected. Commands are never queued.
    pub async fn send(&mut self, command: &EngineCommand) -> Result<(), ChannelError> {
        let Some(writer) = self
            .writer
            .as_mut()
            .filter(|_| self.state == ConnectionState::Connected)
        else {
            warn!(command = command.name(), "Control channel not connected, dropping command");
            return Err(ChannelError::NotConnected(command.name().to_string()));
        };

        let line = command.to_line()?;
        trace!(command = %line.trim_end(), "Sending engine command");
        if let Err(err) = write_line(writer, &line).await {
            warn!(command = command.name(), "Failed to write command: {}", err);
            // the reader reports the closure and drives reconnection
            self.writer = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Delivers a single command over a temporary connection.
    pub async fn send_oneshot(
        endpoint: &Endpoint,
        command: &EngineCommand,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let line = command.to_line()?;
        let delivery = async {
            let mut stream = open_stream(endpoint).await?;
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => result.map_err(ChannelError::from),
            Err(_) => Err(ChannelError::ConnectFailed {
                endpoint: endpoint.to_string(),
                attempts: 1,
            }),
        }
    }
}

async fn write_line(writer: &mut Writer, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(100),
        }
    }

    async fn next_notice(channel: &mut ControlChannel, within: Duration) -> Option<ChannelNotice> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let event = tokio::time::timeout_at(deadline, channel.next_event())
                .await
                .ok()?;
            if let Some(notice) = channel.handle_event(event) {
                return Some(notice);
            }
        }
    }

    #[tokio::test]
    async fn reconnection_stops_at_the_retry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::from_path(dir.path().join("absent.sock"));
        let mut channel = ControlChannel::new(endpoint, policy(3));

        channel.connect();
        let notice = next_notice(&mut channel, Duration::from_secs(5)).await;
        assert!(matches!(
            notice,
            Some(ChannelNotice::RetriesExhausted(ChannelError::ConnectFailed { attempts: 4, .. }))
        ));
        // one initial attempt plus max_retries reconnections
        assert_eq!(channel.attempts(), 4);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(channel.is_exhausted());

        // nothing else happens on its own
        assert!(next_notice(&mut channel, Duration::from_millis(200)).await.is_none());
        assert_eq!(channel.attempts(), 4);

        channel.connect();
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(channel.retry_count(), 0);
        assert!(!channel.is_exhausted());
    }

    #[tokio::test]
    async fn delivers_commands_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::from_path(dir.path().join("engine.sock"));
        let listener = UnixListener::bind(endpoint.path()).unwrap();
        let mut channel = ControlChannel::new(endpoint, policy(1));

        channel.connect();
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            next_notice(&mut channel, Duration::from_secs(2)).await,
            Some(ChannelNotice::Connected)
        ));

        channel
            .send(&EngineCommand::set_property("volume", 30))
            .await
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "{\"command\":[\"set_property\",\"volume\",30]}\n"
        );

        server
            .write_all(b"{\"event\":\"idle\"}\n")
            .await
            .unwrap();
        match next_notice(&mut channel, Duration::from_secs(2)).await {
            Some(ChannelNotice::Message(raw)) => assert_eq!(raw, "{\"event\":\"idle\"}"),
            other => panic!("unexpected notice {other:?}"),
        }

        drop(server);
        assert!(matches!(
            next_notice(&mut channel, Duration::from_secs(2)).await,
            Some(ChannelNotice::Disconnected { retrying: true })
        ));
    }

    #[tokio::test]
    async fn commands_are_dropped_while_disconnected() {
        let mut channel = ControlChannel::new(Endpoint::from_path("/nonexistent.sock"), policy(0));
        let err = channel.send(&EngineCommand::stop()).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(name) if name == "stop"));
    }
}
