#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{FakeEngine, collect_events, test_settings, wait_for_event, write_script};
use loraplayer::{PlaybackController, PlayerEvent, PlayerHandle};
use serde_json::json;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(3);

/// Prints a stream URL derived from the last argument; `slow` pages take
/// a second.
const RESOLVER_SCRIPT: &str = r#"#!/bin/sh
for arg; do url="$arg"; done
case "$url" in
  *slow*) sleep 1; echo "https://cdn.example/slow.m3u8" ;;
  *) echo "https://cdn.example/fast.m3u8"; echo "https://cdn.example/fast-2.m3u8" ;;
esac
"#;

fn is_error(event: &PlayerEvent) -> bool {
    matches!(event, PlayerEvent::ErrorOccurred(_))
}

#[tokio::test]
async fn radio_loads_the_url_once_the_channel_is_up() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let mut settings = test_settings(dir.path(), &fake);
    settings.initial.volume = 42;
    settings.initial.muted = true;

    let player = PlayerHandle::radio_player(&settings);
    let events = player.subscribe();
    player.play("  http://radio.example/live.mp3 ").await;

    assert!(
        fake.wait_until(WAIT, |r| r.iter().any(|r| r.name() == "loadfile"))
            .await
    );
    assert_eq!(fake.loaded_urls(), vec!["http://radio.example/live.mp3"]);

    let received = fake.received();
    let names: Vec<&str> = received.iter().map(|r| r.name()).collect();
    let load_at = names.iter().position(|n| *n == "loadfile").unwrap();
    let observe_at = names.iter().position(|n| *n == "observe_property").unwrap();
    assert!(observe_at < load_at);
    assert_eq!(received[0].command, vec![json!("set_property"), json!("volume"), json!(42)]);
    assert_eq!(received[1].command, vec![json!("set_property"), json!("mute"), json!(true)]);

    let headers = fake
        .received_named("set_property")
        .into_iter()
        .find(|r| r.command[1] == json!("http-header-fields"))
        .unwrap();
    assert_eq!(headers.command[2], json!(""));

    assert_eq!(
        wait_for_event(&events, WAIT, |e| matches!(e, PlayerEvent::PlaybackStateChanged(_))).await,
        Some(PlayerEvent::PlaybackStateChanged(true))
    );
    assert!(player.is_playing());
    player.shutdown().await;
}

#[tokio::test]
async fn empty_url_is_rejected() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));
    let events = player.subscribe();

    player.play("   ").await;
    assert_eq!(
        wait_for_event(&events, WAIT, is_error).await,
        Some(PlayerEvent::ErrorOccurred("Empty URL provided".into()))
    );
    assert!(!player.is_playing());
    player.shutdown().await;
}

#[tokio::test]
async fn newer_play_supersedes_a_pending_resolution() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let mut settings = test_settings(dir.path(), &fake);
    settings.resolver.program = write_script(dir.path(), "resolver.sh", RESOLVER_SCRIPT);

    let player = PlayerHandle::stream_player(&settings);
    assert!(fake.wait_ready(0).await);

    player.play("https://www.youtube.com/watch?v=slow").await;
    player.play("https://www.youtube.com/watch?v=fast").await;

    assert!(
        fake.wait_until(WAIT, |r| r.iter().any(|r| r.name() == "loadfile"))
            .await
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        fake.loaded_urls(),
        vec!["https://cdn.example/fast.m3u8", "https://cdn.example/fast-2.m3u8"]
    );

    let modes: Vec<String> = fake
        .received_named("loadfile")
        .iter()
        .map(|r| r.command[2].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(modes, vec!["replace", "append-play"]);

    let headers = fake
        .received_named("set_property")
        .into_iter()
        .find(|r| r.command[1] == json!("http-header-fields"))
        .unwrap();
    let headers = headers.command[2].as_str().unwrap().to_string();
    assert!(headers.starts_with("Referer: https://www.youtube.com/watch?v=fast,User-Agent: "));
    player.shutdown().await;
}

#[tokio::test]
async fn stop_reports_the_transition_once() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));
    let events = player.subscribe();

    player.play("http://radio.example/live.mp3").await;
    assert!(
        wait_for_event(&events, WAIT, |e| *e == PlayerEvent::PlaybackStateChanged(true))
            .await
            .is_some()
    );

    player.stop().await;
    player.stop().await;

    let stopped = collect_events(&events, Duration::from_millis(300))
        .await
        .into_iter()
        .filter(|e| *e == PlayerEvent::PlaybackStateChanged(false))
        .count();
    assert_eq!(stopped, 1);
    assert!(!player.is_playing());
    assert_eq!(fake.received_named("stop").len(), 1);
    player.shutdown().await;
}

#[tokio::test]
async fn unavailable_format_falls_back_once() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let calls = dir.path().join("calls.log");
    let script = format!(
        "#!/bin/sh\necho \"$*\" >> '{}'\necho 'ERROR: Requested format is not available' >&2\n",
        calls.display()
    );
    let mut settings = test_settings(dir.path(), &fake);
    settings.resolver.program = write_script(dir.path(), "resolver.sh", &script);

    let player = PlayerHandle::stream_player(&settings);
    let events = player.subscribe();
    player.play("dQw4w9WgXcQ").await;

    let error = wait_for_event(&events, WAIT, is_error).await.unwrap();
    let PlayerEvent::ErrorOccurred(message) = error else {
        unreachable!()
    };
    assert!(message.starts_with("Failed to resolve stream"), "{message}");
    assert!(collect_events(&events, Duration::from_millis(300))
        .await
        .iter()
        .all(|e| !is_error(e)));

    let calls = std::fs::read_to_string(&calls).unwrap();
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("-f bestaudio/best"));
    assert!(!calls[1].contains("-f "));
    assert!(calls[1].ends_with("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
    assert!(fake.loaded_urls().is_empty());
    player.shutdown().await;
}

#[tokio::test]
async fn slow_resolver_is_killed_after_the_timeout() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let mut settings = test_settings(dir.path(), &fake);
    settings.resolver.program = write_script(dir.path(), "resolver.sh", "#!/bin/sh\nexec sleep 10\n");
    settings.resolver.timeout = Duration::from_millis(300);

    let player = PlayerHandle::stream_player(&settings);
    let events = player.subscribe();
    let started = Instant::now();
    player.play("https://youtu.be/abc").await;

    let error = wait_for_event(&events, WAIT, is_error).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    let PlayerEvent::ErrorOccurred(message) = error else {
        unreachable!()
    };
    assert!(message.contains("timed out"), "{message}");
    assert!(!player.is_playing());
    player.shutdown().await;
}

/// Zombies count as gone: the runtime reaps them lazily.
#[cfg(target_os = "linux")]
fn process_is_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn superseded_resolver_process_is_killed() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let pid_file = dir.path().join("resolver.pid");
    let script = format!(
        r#"#!/bin/sh
for arg; do url="$arg"; done
case "$url" in
  *slow*) echo $$ > "{}"; exec sleep 30 ;;
  *) echo "https://cdn.example/fast.m3u8" ;;
esac
"#,
        pid_file.display()
    );
    let mut settings = test_settings(dir.path(), &fake);
    settings.resolver.program = write_script(dir.path(), "resolver.sh", &script);

    let player = PlayerHandle::stream_player(&settings);
    assert!(fake.wait_ready(0).await);
    player.play("https://www.youtube.com/watch?v=slow").await;

    let deadline = Instant::now() + WAIT;
    let pid = loop {
        if let Ok(pid) = std::fs::read_to_string(&pid_file) {
            if !pid.trim().is_empty() {
                break pid.trim().to_string();
            }
        }
        assert!(Instant::now() < deadline, "slow resolver never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(process_is_alive(&pid));

    player.play("https://www.youtube.com/watch?v=fast").await;
    assert!(
        fake.wait_until(WAIT, |r| r.iter().any(|r| r.name() == "loadfile"))
            .await
    );
    assert_eq!(fake.loaded_urls(), vec!["https://cdn.example/fast.m3u8"]);

    let deadline = Instant::now() + WAIT;
    while process_is_alive(&pid) {
        assert!(Instant::now() < deadline, "superseded resolver {pid} still running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    player.shutdown().await;
}

#[tokio::test]
async fn unchanged_volume_is_not_resent() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));
    let events = player.subscribe();
    assert!(fake.wait_ready(0).await);

    player.set_volume(73).await;
    player.set_volume(73).await;
    player.set_volume(250).await;

    let volumes: Vec<u8> = collect_events(&events, Duration::from_millis(200))
        .await
        .into_iter()
        .filter_map(|e| match e {
            PlayerEvent::VolumeChanged(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(volumes, vec![73, 100]);
    assert_eq!(player.volume(), 100);

    let sent: Vec<_> = fake
        .received_named("set_property")
        .into_iter()
        .filter(|r| r.command[1] == json!("volume"))
        .map(|r| r.command[2].clone())
        .collect();
    assert_eq!(sent, vec![json!(50), json!(73), json!(100)]);
    player.shutdown().await;
}

#[tokio::test]
async fn engine_volume_reports_update_the_facade() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));
    let events = player.subscribe();
    assert!(fake.wait_ready(0).await);

    fake.emit(json!({"event": "property-change", "id": 1, "name": "volume", "data": 61.6}))
        .await;
    fake.emit(json!({"event": "property-change", "id": 2, "name": "mute", "data": true}))
        .await;

    assert_eq!(
        wait_for_event(&events, WAIT, |e| matches!(e, PlayerEvent::MutedChanged(_))).await,
        Some(PlayerEvent::MutedChanged(true))
    );
    assert_eq!(player.volume(), 62);
    assert!(player.is_muted());
    player.shutdown().await;
}

#[tokio::test]
async fn toggle_pauses_a_loaded_stream() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));
    let events = player.subscribe();

    player.play("http://radio.example/live.mp3").await;
    assert!(
        wait_for_event(&events, WAIT, |e| *e == PlayerEvent::PlaybackStateChanged(true))
            .await
            .is_some()
    );

    player.toggle_playback().await;
    assert!(!player.is_playing());
    let cycles = fake.received_named("cycle");
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].command[1], json!("pause"));
    player.shutdown().await;
}

#[tokio::test]
async fn stream_error_is_reported_by_the_video_player() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let mut settings = test_settings(dir.path(), &fake);
    settings.resolver.program = write_script(dir.path(), "resolver.sh", RESOLVER_SCRIPT);

    let player = PlayerHandle::stream_player(&settings);
    let events = player.subscribe();
    player.play("https://youtu.be/abc").await;
    assert!(
        wait_for_event(&events, WAIT, |e| *e == PlayerEvent::PlaybackStateChanged(true))
            .await
            .is_some()
    );

    fake.emit(json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}))
        .await;
    assert_eq!(
        wait_for_event(&events, WAIT, is_error).await,
        Some(PlayerEvent::ErrorOccurred(
            "Failed to play media: loading failed".into()
        ))
    );
    assert!(!player.is_playing());
    player.shutdown().await;
}

#[tokio::test]
async fn radio_reloads_a_failed_stream() {
    let dir = tempdir().unwrap();
    let fake = FakeEngine::bind(dir.path());
    let player = PlayerHandle::radio_player(&test_settings(dir.path(), &fake));

    player.play("http://radio.example/live.mp3").await;
    assert!(
        fake.wait_until(WAIT, |r| r.iter().any(|r| r.name() == "loadfile"))
            .await
    );

    fake.emit(json!({"event": "end-file", "reason": "error", "file_error": "network"}))
        .await;
    assert!(
        fake.wait_until(WAIT, |r| r.iter().filter(|r| r.name() == "loadfile").count() == 2)
            .await
    );
    assert_eq!(
        fake.loaded_urls(),
        vec!["http://radio.example/live.mp3", "http://radio.example/live.mp3"]
    );
    player.shutdown().await;
}
