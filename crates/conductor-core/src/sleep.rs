//! Sleep detection
//!
//! The host suspending (laptop lid closed) freezes every timer at once.
//! A one-second heartbeat that suddenly observes a gap above the
//! threshold means the machine slept; the wake event triggers a health
//! sweep over all sessions.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Heartbeat period.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Wall-clock gap between two heartbeats that indicates a suspension.
const SLEEP_THRESHOLD: Duration = Duration::from_secs(15);

/// Emitted on the wake channel with the estimated sleep duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeEvent {
    pub slept_for: Duration,
}

/// Watches for monotonic-clock gaps and reports wake-ups.
pub struct SleepDetector {
    check_interval: Duration,
    threshold: Duration,
    wake_tx: mpsc::Sender<WakeEvent>,
}

impl SleepDetector {
    pub fn new() -> (Self, mpsc::Receiver<WakeEvent>) {
        Self::with_timing(CHECK_INTERVAL, SLEEP_THRESHOLD)
    }

    pub fn with_timing(
        check_interval: Duration,
        threshold: Duration,
    ) -> (Self, mpsc::Receiver<WakeEvent>) {
        let (wake_tx, wake_rx) = mpsc::channel(4);
        (
            Self {
                check_interval,
                threshold,
                wake_tx,
            },
            wake_rx,
        )
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Sleep detector started");
        let mut last_check = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_check);
                    if elapsed > self.threshold {
                        let slept_for = elapsed.saturating_sub(self.check_interval);
                        warn!(
                            slept_secs = slept_for.as_secs(),
                            "Wake detected after suspension"
                        );
                        let _ = self.wake_tx.send(WakeEvent { slept_for }).await;
                    }
                    last_check = now;
                }
                _ = shutdown.changed() => {
                    info!("Sleep detector stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gap_fires_wake_event() {
        let (detector, mut wake_rx) = SleepDetector::new();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(detector.run(shutdown_rx));
        tokio::task::yield_now().await;

        // Jump the clock 30 s in one step, as a suspension would.
        tokio::time::advance(Duration::from_secs(30)).await;

        let wake = wake_rx.recv().await.unwrap();
        assert!(wake.slept_for >= Duration::from_secs(15));

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_heartbeats_fire_nothing() {
        let (detector, mut wake_rx) = SleepDetector::new();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(detector.run(shutdown_rx));
        tokio::task::yield_now().await;

        // Advance in sub-threshold steps: ordinary passage of time.
        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(wake_rx.try_recv().is_err());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
