//! Graceful-then-escalating termination of the engine.
//!
//! Phases: pause/stop over the channel, `quit`, terminate, kill, then an
//! OS-level kill of the process tree. The whole sequence fits in the budget.

use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::channel::{ControlChannel, EngineCommand};
use crate::process::{ProcessHandle, kill_process_tree};

const SETTLE_DELAY: Duration = Duration::from_millis(100);
const KILL_FLOOR: Duration = Duration::from_millis(500);
const QUIT_SHARE: f64 = 0.4;
const TERMINATE_SHARE: f64 = 0.3;

/// Phase that confirmed the exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPhase {
    AlreadyExited,
    Quit,
    Terminate,
    Kill,
    ForceKillTree,
    /// Still running when the budget ran out.
    Unconfirmed,
}

#[derive(Clone, Copy, Debug)]
pub struct ShutdownReport {
    pub phase: ShutdownPhase,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct ShutdownSequencer {
    budget: Duration,
    settle_delay: Duration,
    kill_floor: Duration,
}

impl ShutdownSequencer {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            settle_delay: SETTLE_DELAY,
            kill_floor: KILL_FLOOR.min(budget),
        }
    }

    /// Wait allowed for an early phase: its share of the budget, capped so
    /// the kill phase keeps its floor.
    fn phase_wait(&self, share: f64, now: Instant, deadline: Instant) -> Duration {
        let reserved = deadline
            .checked_sub(self.kill_floor)
            .map(|limit| limit.saturating_duration_since(now))
            .unwrap_or_default();
        self.budget.mul_f64(share).min(reserved)
    }

    pub async fn run(
        &self,
        channel: &mut ControlChannel,
        process: &mut ProcessHandle,
    ) -> ShutdownReport {
        let start = Instant::now();
        let deadline = start + self.budget;
        let report = |phase| ShutdownReport {
            phase,
            elapsed: start.elapsed(),
        };
        let pid = process.id();

        if !process.is_running() {
            return report(ShutdownPhase::AlreadyExited);
        }
        info!(pid = ?pid, budget = ?self.budget, "Shutting down playback engine");
        channel.set_shutting_down(true);

        // 1. pause then stop, if we can still talk to the engine. A write
        // that does not complete in time leaves the primary channel unusable.
        let mut responsive = channel.is_connected();
        for command in [EngineCommand::set_property("pause", true), EngineCommand::stop()] {
            if !responsive {
                break;
            }
            let settle = self.settle_delay.min(self.phase_wait(1.0, Instant::now(), deadline));
            responsive = send_within(channel, &command, settle).await;
            sleep(settle).await;
        }

        // 2. quit, over a temporary connection if the primary one is gone
        let quit = EngineCommand::quit();
        let delivered = responsive
            && channel.is_connected()
            && send_within(channel, &quit, self.phase_wait(QUIT_SHARE, Instant::now(), deadline))
                .await;
        if !delivered {
            let wait = self.phase_wait(QUIT_SHARE, Instant::now(), deadline);
            if let Err(err) = ControlChannel::send_oneshot(channel.endpoint(), &quit, wait).await
            {
                debug!("Temporary channel could not deliver quit: {}", err);
            }
        }
        let wait = self.phase_wait(QUIT_SHARE, Instant::now(), deadline);
        if process.wait_for_exit(wait).await {
            return report(ShutdownPhase::Quit);
        }

        // 3. terminate
        debug!(pid = ?pid, "Engine ignored quit, terminating");
        process.terminate();
        let wait = self.phase_wait(TERMINATE_SHARE, Instant::now(), deadline);
        if process.wait_for_exit(wait).await {
            return report(ShutdownPhase::Terminate);
        }

        // 4. kill, with whatever budget is left
        warn!(pid = ?pid, "Engine ignored terminate, killing");
        process.kill();
        let wait = deadline.saturating_duration_since(Instant::now());
        if process.wait_for_exit(wait).await {
            return report(ShutdownPhase::Kill);
        }

        // 5. last resort
        if let Some(pid) = pid {
            kill_process_tree(pid);
        }
        if process.wait_for_exit(Duration::ZERO).await {
            report(ShutdownPhase::ForceKillTree)
        } else {
            warn!(pid = ?pid, "Engine still running after shutdown budget");
            report(ShutdownPhase::Unconfirmed)
        }
    }
}

async fn send_within(
    channel: &mut ControlChannel,
    command: &EngineCommand,
    wait: Duration,
) -> bool {
    match timeout(wait, channel.send(command)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(command = command.name(), "Shutdown command not sent: {}", err);
            false
        }
        Err(_) => {
            debug!(command = command.name(), "Engine is not reading its channel");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_phases_get_their_share() {
        let sequencer = ShutdownSequencer::new(Duration::from_millis(5000));
        let now = Instant::now();
        let deadline = now + Duration::from_millis(5000);

        assert_eq!(
            sequencer.phase_wait(QUIT_SHARE, now, deadline),
            Duration::from_millis(2000)
        );
        assert_eq!(
            sequencer.phase_wait(TERMINATE_SHARE, now, deadline),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn kill_floor_is_reserved() {
        let sequencer = ShutdownSequencer::new(Duration::from_millis(2500));
        let deadline = Instant::now() + Duration::from_millis(2500);
        // 1800ms already spent: only 200ms before the floor
        let now = deadline - Duration::from_millis(700);

        assert_eq!(
            sequencer.phase_wait(TERMINATE_SHARE, now, deadline),
            Duration::from_millis(200)
        );
        let late = deadline - Duration::from_millis(300);
        assert_eq!(
            sequencer.phase_wait(TERMINATE_SHARE, late, deadline),
            Duration::ZERO
        );
    }

    #[test]
    fn floor_never_exceeds_budget() {
        let sequencer = ShutdownSequencer::new(Duration::from_millis(200));
        assert_eq!(sequencer.kill_floor, Duration::from_millis(200));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_engine_is_stopped_within_budget() {
        use crate::channel::Endpoint;
        use crate::settings::RetryPolicy;
        use std::path::Path;

        let dir = tempfile::tempdir().unwrap();
        let mut channel = ControlChannel::new(
            Endpoint::from_path(dir.path().join("gone.sock")),
            RetryPolicy::default(),
        );
        let mut process = ProcessHandle::start(
            Path::new("/bin/sh"),
            &["-c".to_string(), "trap '' TERM; exec sleep 30".to_string()],
        )
        .unwrap();

        let budget = Duration::from_millis(1500);
        let report = ShutdownSequencer::new(budget).run(&mut channel, &mut process).await;

        assert_eq!(report.phase, ShutdownPhase::Kill);
        assert!(report.elapsed <= budget + Duration::from_millis(100));
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_channel_does_not_hold_up_shutdown() {
        use crate::channel::{ChannelNotice, Endpoint};
        use crate::settings::RetryPolicy;
        use std::path::Path;

        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::from_path(dir.path().join("stalled.sock"));
        let listener = tokio::net::UnixListener::bind(endpoint.path()).unwrap();
        // accepts, then never reads
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let mut channel = ControlChannel::new(endpoint, RetryPolicy::default());
        channel.connect();
        timeout(Duration::from_secs(2), async {
            loop {
                let event = channel.next_event().await;
                if let Some(ChannelNotice::Connected) = channel.handle_event(event) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        // fill the socket buffer until writes block
        let filler = "x".repeat(64 * 1024);
        let mut blocked = false;
        for _ in 0..1000 {
            let command = EngineCommand::set_property("title", filler.as_str());
            if timeout(Duration::from_millis(50), channel.send(&command))
                .await
                .is_err()
            {
                blocked = true;
                break;
            }
        }
        assert!(blocked);

        let mut process = ProcessHandle::start(
            Path::new("/bin/sh"),
            &["-c".to_string(), "trap '' TERM; exec sleep 30".to_string()],
        )
        .unwrap();
        let budget = Duration::from_secs(1);
        let report = ShutdownSequencer::new(budget).run(&mut channel, &mut process).await;

        assert!(report.elapsed <= budget + Duration::from_millis(100));
        assert!(!process.is_running());
        holder.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_engine_needs_nothing() {
        use crate::channel::Endpoint;
        use crate::settings::RetryPolicy;
        use std::path::Path;

        let mut channel =
            ControlChannel::new(Endpoint::from_path("/nonexistent.sock"), RetryPolicy::default());
        let mut process =
            ProcessHandle::start(Path::new("/bin/sh"), &["-c".to_string(), "exit 0".to_string()])
                .unwrap();
        process.wait().await;

        let report = ShutdownSequencer::new(Duration::from_secs(3))
            .run(&mut channel, &mut process)
            .await;
        assert_eq!(report.phase, ShutdownPhase::AlreadyExited);
    }
}
