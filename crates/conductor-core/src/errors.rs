//! Error taxonomy and repeated-error escalation
//!
//! Components classify their failures into a small set of kinds. The
//! escalator counts occurrences per kind inside a rolling five-minute
//! window and raises a single system alert when a kind keeps recurring,
//! so a broken API key produces one message instead of one per attempt.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::error;

/// Failure kinds, independent of the concrete error types that carry them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("transport unreachable")]
    TransportUnreachable,
    #[error("transport throttled")]
    TransportThrottled,
    #[error("credentials rejected")]
    AuthDenied,
    #[error("pane lost")]
    PaneLost,
    #[error("store busy")]
    StoreBusy,
    #[error("classifier miss")]
    ClassifierMiss,
    #[error("configuration invalid")]
    ConfigInvalid,
    #[error("invalid user input")]
    UserInputInvalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportUnreachable => "transport_unreachable",
            ErrorKind::TransportThrottled => "transport_throttled",
            ErrorKind::AuthDenied => "auth_denied",
            ErrorKind::PaneLost => "pane_lost",
            ErrorKind::StoreBusy => "store_busy",
            ErrorKind::ClassifierMiss => "classifier_miss",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::UserInputInvalid => "user_input_invalid",
        }
    }
}

/// Occurrences of one kind within the window before a single alert fires.
const ESCALATION_THRESHOLD: u32 = 5;
const WINDOW: Duration = Duration::from_secs(300);

struct KindWindow {
    count: u32,
    window_start: Instant,
}

/// Counts errors per kind and emits one alert per recurring failure mode.
pub struct ErrorEscalator {
    counts: Mutex<HashMap<ErrorKind, KindWindow>>,
    alerts_tx: mpsc::Sender<String>,
}

impl ErrorEscalator {
    /// Alerts are delivered on the returned receiver; the daemon forwards
    /// them to the notifier as immediate system messages.
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (alerts_tx, alerts_rx) = mpsc::channel(16);
        (
            Self {
                counts: Mutex::new(HashMap::new()),
                alerts_tx,
            },
            alerts_rx,
        )
    }

    /// Record one failure. Logs always; queues an alert when the kind
    /// reaches the threshold within the current window, then resets that
    /// kind's counter.
    pub fn record(&self, kind: ErrorKind, context: &str) {
        error!(kind = kind.as_str(), context, "Component error");

        let escalate = {
            let mut counts = self.counts.lock().unwrap();
            let entry = counts.entry(kind).or_insert_with(|| KindWindow {
                count: 0,
                window_start: Instant::now(),
            });
            if entry.window_start.elapsed() > WINDOW {
                entry.count = 0;
                entry.window_start = Instant::now();
            }
            entry.count += 1;
            if entry.count >= ESCALATION_THRESHOLD {
                entry.count = 0;
                entry.window_start = Instant::now();
                true
            } else {
                false
            }
        };

        if escalate {
            let alert = format!(
                "🔴 Repeated error in {context}: {} ({ESCALATION_THRESHOLD}x in 5m). \
                 Check daemon logs: ~/.conductor/logs/conductor.log",
                kind.as_str()
            );
            let _ = self.alerts_tx.try_send(alert);
        }
    }

    #[cfg(test)]
    fn count_for(&self, kind: ErrorKind) -> u32 {
        self.counts
            .lock()
            .unwrap()
            .get(&kind)
            .map(|w| w.count)
            .unwrap_or(0)
    }
}
