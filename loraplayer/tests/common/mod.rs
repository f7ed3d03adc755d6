//! Fake engine and resolver used by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use loraplayer::settings::PlayerSettings;
use loraplayer::{Endpoint, PlayerEvent};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::task::JoinHandle;

/// Engine that never plays anything.
pub const ENGINE_SCRIPT: &str = "#!/bin/sh\nexec sleep 30\n";

/// Command received by the fake engine, tagged with its connection index.
#[derive(Clone, Debug)]
pub struct Received {
    pub connection: usize,
    pub command: Vec<Value>,
}

impl Received {
    pub fn name(&self) -> &str {
        self.command.first().and_then(Value::as_str).unwrap_or("")
    }
}

/// Listens on an IPC socket like the engine would and records every
/// command line it receives.
pub struct FakeEngine {
    endpoint: Endpoint,
    received: Arc<Mutex<Vec<Received>>>,
    writers: Arc<tokio::sync::Mutex<Vec<OwnedWriteHalf>>>,
    accept: JoinHandle<()>,
}

/// Routes the crate's logs to the test output; `RUST_LOG` selects the level.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl FakeEngine {
    pub fn bind(dir: &Path) -> Self {
        Self::listen(Endpoint::for_host_process(dir, "fake-engine"))
    }

    /// Listens on a given endpoint, e.g. one a player already points at.
    pub fn listen(endpoint: Endpoint) -> Self {
        init_logging();
        let listener = UnixListener::bind(endpoint.path()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let writers = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let accept = {
            let received = received.clone();
            let writers = writers.clone();
            tokio::spawn(async move {
                let mut connection = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    let (read_half, write_half) = stream.into_split();
                    writers.lock().await.push(write_half);

                    let received = received.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(read_half).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            if let Some(command) = value["command"].as_array() {
                                received.lock().push(Received {
                                    connection,
                                    command: command.clone(),
                                });
                            }
                        }
                    });
                    connection += 1;
                }
            })
        };

        Self {
            endpoint,
            received,
            writers,
            accept,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stops listening and hangs up on every client, like a dead engine
    /// would. Returns the endpoint so a new fake can take it over.
    pub async fn close(self) -> Endpoint {
        self.accept.abort();
        self.writers.lock().await.clear();
        let _ = fs::remove_file(self.endpoint.path());
        self.endpoint.clone()
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    pub fn received_named(&self, name: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.name() == name)
            .collect()
    }

    /// `loadfile` targets in arrival order.
    pub fn loaded_urls(&self) -> Vec<String> {
        self.received_named("loadfile")
            .iter()
            .filter_map(|r| r.command.get(1).and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.writers.lock().await.len()
    }

    /// Sends an event line to the most recent connection.
    pub async fn emit(&self, event: Value) {
        let mut writers = self.writers.lock().await;
        let writer = writers.last_mut().unwrap();
        let mut line = event.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Polls until `predicate` holds on the received commands.
    pub async fn wait_until(
        &self,
        within: Duration,
        predicate: impl Fn(&[Received]) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if predicate(&self.received()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits for the property observation that ends the connect handshake.
    pub async fn wait_ready(&self, connection: usize) -> bool {
        self.wait_until(Duration::from_secs(3), |received| {
            received
                .iter()
                .any(|r| r.connection == connection && r.name() == "observe_property")
        })
        .await
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Settings pointing at the fake engine with short delays.
pub fn test_settings(dir: &Path, fake: &FakeEngine) -> PlayerSettings {
    settings_for(dir, fake.endpoint())
}

/// Same as [`test_settings`], for an endpoint nobody may be listening on yet.
pub fn settings_for(dir: &Path, endpoint: &Endpoint) -> PlayerSettings {
    let stem = endpoint.path().file_stem().unwrap().to_string_lossy();
    let mut settings = PlayerSettings::default();
    settings.engine.program = write_script(dir, &format!("{stem}.sh"), ENGINE_SCRIPT);
    settings.engine.ipc_directory = dir.to_path_buf();
    settings.engine.endpoint = Some(endpoint.clone());
    settings.engine.restart_delay = Duration::from_millis(100);
    settings.engine.shutdown_budget = Duration::from_secs(1);
    settings.channel.base_delay = Duration::from_millis(20);
    settings.channel.connect_timeout = Duration::from_millis(200);
    settings.resolver.timeout = Duration::from_secs(5);
    settings.radio_reconnect_delay = Duration::from_millis(100);
    settings
}

/// Polls `events` until one matches, without blocking the runtime.
pub async fn wait_for_event(
    events: &Receiver<PlayerEvent>,
    within: Duration,
    predicate: impl Fn(&PlayerEvent) -> bool,
) -> Option<PlayerEvent> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        while let Ok(event) = events.try_recv() {
            if predicate(&event) {
                return Some(event);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Everything received on `events` during `window`.
pub async fn collect_events(events: &Receiver<PlayerEvent>, window: Duration) -> Vec<PlayerEvent> {
    tokio::time::sleep(window).await;
    events.try_iter().collect()
}
