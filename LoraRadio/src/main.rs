//! LoraRadio: plays radio streams and video-site audio from the terminal.
//!
//! Reads one command per line on stdin:
//!
//! ```text
//! play <url>     (a bare URL works too)
//! stop
//! toggle
//! volume <0-100>
//! mute | unmute
//! status
//! quit
//! ```

use std::env;
use std::io::{self, BufRead};
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use loraconfig::Config;
use loraplayer::{PlaybackController, PlayerConfigExt, PlayerEvent, SwitchPlayer};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct AppOptions {
    config_dir: String,
    initial_url: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Play(String),
    Stop,
    Toggle,
    Volume(u8),
    Mute(bool),
    Status,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = resolve_options()?;
    let config = Arc::new(
        Config::load_config(&options.config_dir).context("Unable to load configuration")?,
    );
    init_tracing(&config);

    let settings = config.player_settings()?;
    info!(
        config_dir = %config.directory(),
        resolver = %settings.resolver.program.display(),
        engine = %settings.engine.program.display(),
        "Starting LoraRadio"
    );

    let player = SwitchPlayer::spawn(&settings);
    watch_events(&player, config.clone());

    if let Some(url) = options.initial_url {
        player.play(&url).await;
    }

    let mut lines = read_stdin_lines();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => run_command(&player, command).await,
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    player.shutdown().await;
    info!("Bye");
    Ok(())
}

/// Stdin lines, read on a plain thread. A blocked read must not keep the
/// runtime alive at exit.
fn read_stdin_lines() -> UnboundedReceiver<String> {
    let (tx, rx) = unbounded_channel();
    let spawned = thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Failed to spawn stdin reader: {}", err);
    }
    rx
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config
            .get_log_min_level()
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level.to_lowercase())
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn resolve_options() -> Result<AppOptions> {
    let mut args = env::args().skip(1);
    let mut config_dir = String::new();
    let mut initial_url = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-dir" => {
                config_dir = args
                    .next()
                    .ok_or_else(|| anyhow!("--config-dir requires a value"))?;
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other if other.starts_with('-') => {
                bail!("Unknown argument: {other}. Use --help for usage.")
            }
            url => initial_url = Some(url.to_string()),
        }
    }
    Ok(AppOptions {
        config_dir,
        initial_url,
    })
}

fn print_usage() {
    println!("Usage: LoraRadio [--config-dir <dir>] [url]");
    println!();
    println!("Commands on stdin: play <url>, stop, toggle, volume <0-100>, mute, unmute, status, quit");
    println!("The config directory defaults to $LORARADIO_CONFIG, ./.loraradio or ~/.loraradio");
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "play" if rest.is_empty() => bail!("play requires a URL"),
        "play" => Command::Play(rest.to_string()),
        "stop" => Command::Stop,
        "toggle" | "pause" => Command::Toggle,
        "volume" | "vol" => {
            let volume: u8 = rest
                .parse()
                .with_context(|| format!("Invalid volume: {rest:?}"))?;
            Command::Volume(volume.min(100))
        }
        "mute" => Command::Mute(true),
        "unmute" => Command::Mute(false),
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        _ if rest.is_empty() && (line.contains("://") || line.contains('.')) => {
            Command::Play(line.to_string())
        }
        _ if rest.is_empty() && loraplayer::player::looks_like_video_site(line, &[]) => {
            Command::Play(line.to_string())
        }
        other => bail!("Unknown command: {other}"),
    };
    Ok(Some(command))
}

async fn run_command(player: &SwitchPlayer, command: Command) {
    match command {
        Command::Play(url) => player.play(&url).await,
        Command::Stop => player.stop().await,
        Command::Toggle => player.toggle_playback().await,
        Command::Volume(volume) => player.set_volume(volume).await,
        Command::Mute(muted) => player.set_muted(muted).await,
        Command::Status => println!(
            "source: {:?}, playing: {}, volume: {}, muted: {}",
            player.active_source(),
            player.is_playing(),
            player.volume(),
            player.is_muted()
        ),
        Command::Quit => {}
    }
}

/// Prints player events and persists volume and mute changes.
fn watch_events(player: &SwitchPlayer, config: Arc<Config>) {
    let events = player.subscribe();
    let spawned = thread::Builder::new()
        .name("player-events".into())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                match event {
                    PlayerEvent::PlaybackStateChanged(playing) => {
                        println!("{}", if playing { "playing" } else { "stopped" });
                    }
                    PlayerEvent::VolumeChanged(volume) => {
                        println!("volume {volume}");
                        if let Err(err) = config.set_player_volume(volume) {
                            warn!("Failed to persist volume: {}", err);
                        }
                    }
                    PlayerEvent::MutedChanged(muted) => {
                        println!("{}", if muted { "muted" } else { "unmuted" });
                        if let Err(err) = config.set_player_muted(muted) {
                            warn!("Failed to persist mute state: {}", err);
                        }
                    }
                    PlayerEvent::ErrorOccurred(message) => eprintln!("error: {message}"),
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Failed to spawn event watcher: {}", err);
    }
}
