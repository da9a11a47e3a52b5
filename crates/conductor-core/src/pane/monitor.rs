//! Pane monitor
//!
//! One polling loop per session. Each tick captures the pane, pushes the
//! capture through the output buffer, classifies whatever is new and
//! forwards detections to the dispatcher channel. The poll period adapts
//! to activity; a long-enough quiet spell after a burst produces a
//! synthetic completion candidate so finished work is noticed even when
//! no completion phrase was printed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, DetectionKind, DetectionResult};
use crate::config::MonitorConfig;
use crate::pane::buffer::OutputBuffer;
use crate::pane::tmux::PaneAdapter;

/// How many scrollback lines each capture asks for.
const CAPTURE_LINES: usize = 1000;
/// Idle time after which polling drops to the slow interval.
const LONG_IDLE_SECS: f64 = 300.0;
/// Poll period while the session is paused.
const PAUSED_POLL: Duration = Duration::from_secs(5);

/// Monitor lifecycle: `starting -> idle <-> active -> ending`.
/// `ending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Starting,
    Idle,
    Active,
    Ending,
}

/// What a monitor reports to the dispatcher.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// New output matched a classifier tier
    Detected {
        session_id: String,
        result: DetectionResult,
        lines: Vec<String>,
    },
    /// Burst of output followed by a long quiet spell that looks finished
    CompletionCandidate {
        session_id: String,
        lines: Vec<String>,
    },
    /// Capture failed; the pane is gone
    PaneLost { session_id: String },
}

impl MonitorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            MonitorEvent::Detected { session_id, .. } => session_id,
            MonitorEvent::CompletionCandidate { session_id, .. } => session_id,
            MonitorEvent::PaneLost { session_id } => session_id,
        }
    }
}

/// Handle for pausing or stopping a running monitor from outside.
#[derive(Debug, Clone, Default)]
pub struct MonitorControl {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MonitorControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Watches one pane for output and reports detections.
pub struct PaneMonitor {
    session_id: String,
    alias: String,
    pane: Arc<dyn PaneAdapter>,
    buffer: OutputBuffer,
    classifier: Classifier,
    events_tx: mpsc::Sender<MonitorEvent>,
    control: MonitorControl,
    config: MonitorConfig,

    state: MonitorState,
    idle_seconds: f64,
    active_output: bool,
}

impl PaneMonitor {
    pub fn new(
        session_id: &str,
        alias: &str,
        pane: Arc<dyn PaneAdapter>,
        events_tx: mpsc::Sender<MonitorEvent>,
        config: MonitorConfig,
    ) -> (Self, MonitorControl) {
        let control = MonitorControl::default();
        let monitor = Self {
            session_id: session_id.to_string(),
            alias: alias.to_string(),
            pane,
            buffer: OutputBuffer::new(config.output_buffer_max_lines),
            classifier: Classifier::new(),
            events_tx,
            control: control.clone(),
            config,
            state: MonitorState::Starting,
            idle_seconds: 0.0,
            active_output: false,
        };
        (monitor, control)
    }

    /// Current poll period. The main latency/CPU knob.
    fn poll_interval(&self) -> Duration {
        if self.control.is_paused() {
            PAUSED_POLL
        } else if self.idle_seconds > LONG_IDLE_SECS {
            Duration::from_millis(self.config.idle_poll_interval_ms)
        } else if self.active_output {
            Duration::from_millis(self.config.active_poll_interval_ms)
        } else {
            Duration::from_millis(self.config.poll_interval_ms)
        }
    }

    /// Run until the pane dies or the control handle stops us.
    pub async fn run(mut self) {
        info!(session = %self.alias, "Monitor started");
        self.state = MonitorState::Idle;

        while !self.control.is_stopped() {
            let interval = self.poll_interval();

            match self.pane.capture_recent(CAPTURE_LINES).await {
                Ok(raw) => {
                    let fresh = self.buffer.ingest(&raw);
                    if fresh.is_empty() {
                        self.idle_seconds += interval.as_secs_f64();
                        if self.active_output
                            && self.idle_seconds >= self.config.completion_idle_threshold_s as f64
                        {
                            self.active_output = false;
                            self.state = MonitorState::Idle;
                            self.check_completion().await;
                        }
                    } else {
                        self.idle_seconds = 0.0;
                        self.active_output = true;
                        self.state = MonitorState::Active;
                        self.process_output(fresh).await;
                    }
                }
                Err(e) => {
                    warn!(session = %self.alias, error = %e, "Capture failed, pane lost");
                    self.state = MonitorState::Ending;
                    let _ = self
                        .events_tx
                        .send(MonitorEvent::PaneLost {
                            session_id: self.session_id.clone(),
                        })
                        .await;
                    return;
                }
            }

            tokio::time::sleep(interval).await;
        }

        self.state = MonitorState::Ending;
        info!(session = %self.alias, state = ?self.state, "Monitor stopped");
    }

    async fn process_output(&mut self, lines: Vec<String>) {
        let text = lines.join("\n");
        let result = self.classifier.classify(&text);
        if result.kind == DetectionKind::None {
            return;
        }
        debug!(
            session = %self.alias,
            kind = ?result.kind,
            matched = %result.matched_text,
            "Detection"
        );
        let _ = self
            .events_tx
            .send(MonitorEvent::Detected {
                session_id: self.session_id.clone(),
                result,
                lines,
            })
            .await;
    }

    /// Idle after a burst: re-classify the tail and surface a candidate
    /// completion even when the classifier stays quiet.
    async fn check_completion(&mut self) {
        let recent: Vec<String> = self.buffer.tail(10).to_vec();
        if recent.is_empty() {
            return;
        }
        let _ = self
            .events_tx
            .send(MonitorEvent::CompletionCandidate {
                session_id: self.session_id.clone(),
                lines: recent,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::tmux::PaneError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted pane: returns captures in order, then repeats the last one.
    struct FakePane {
        captures: Mutex<VecDeque<Result<Vec<String>, ()>>>,
        last: Mutex<Vec<String>>,
    }

    impl FakePane {
        fn new(captures: Vec<Result<Vec<&str>, ()>>) -> Self {
            Self {
                captures: Mutex::new(
                    captures
                        .into_iter()
                        .map(|c| c.map(|ls| ls.iter().map(|s| s.to_string()).collect()))
                        .collect(),
                ),
                last: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaneAdapter for FakePane {
        async fn capture_recent(&self, _max: usize) -> Result<Vec<String>, PaneError> {
            let next = self.captures.lock().unwrap().pop_front();
            match next {
                Some(Ok(lines)) => {
                    *self.last.lock().unwrap() = lines.clone();
                    Ok(lines)
                }
                Some(Err(())) => Err(PaneError::PaneGone("%0".to_string())),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }

        async fn send(&self, _text: &str, _enter: bool) -> Result<(), PaneError> {
            Ok(())
        }

        async fn interrupt(&self) -> Result<(), PaneError> {
            Ok(())
        }
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 10,
            active_poll_interval_ms: 10,
            idle_poll_interval_ms: 10,
            output_buffer_max_lines: 100,
            completion_idle_threshold_s: 1,
        }
    }

    async fn collect_until<F>(rx: &mut mpsc::Receiver<MonitorEvent>, mut pred: F) -> Vec<MonitorEvent>
    where
        F: FnMut(&MonitorEvent) -> bool,
    {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = pred(&event);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_emitted_for_new_output() {
        let pane = Arc::new(FakePane::new(vec![Ok(vec!["Build succeeded"])]));
        let (tx, mut rx) = mpsc::channel(16);
        let (monitor, control) = PaneMonitor::new("s1", "app", pane, tx, test_config());
        tokio::spawn(monitor.run());

        let events = collect_until(&mut rx, |e| matches!(e, MonitorEvent::Detected { .. })).await;
        control.stop();

        match &events[0] {
            MonitorEvent::Detected { result, lines, .. } => {
                assert_eq!(result.kind, DetectionKind::Completion);
                assert_eq!(lines, &vec!["Build succeeded".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_capture_emits_nothing_then_candidate() {
        // A burst with no classifiable phrase, then silence long enough to
        // cross the completion threshold.
        let pane = Arc::new(FakePane::new(vec![Ok(vec![
            "compiling a",
            "compiling b",
            "linking final binary",
        ])]));
        let (tx, mut rx) = mpsc::channel(16);
        let (monitor, control) = PaneMonitor::new("s1", "app", pane, tx, test_config());
        tokio::spawn(monitor.run());

        let events = collect_until(&mut rx, |e| {
            matches!(e, MonitorEvent::CompletionCandidate { .. })
        })
        .await;
        control.stop();

        // No Detected events for unclassifiable output, exactly one candidate.
        assert_eq!(events.len(), 1);
        match &events[0] {
            MonitorEvent::CompletionCandidate { lines, .. } => {
                assert!(lines.contains(&"linking final binary".to_string()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pane_loss_is_terminal() {
        let pane = Arc::new(FakePane::new(vec![Ok(vec!["hello?"]), Err(())]));
        let (tx, mut rx) = mpsc::channel(16);
        let (monitor, _control) = PaneMonitor::new("s1", "app", pane, tx, test_config());
        let handle = tokio::spawn(monitor.run());

        let events = collect_until(&mut rx, |e| matches!(e, MonitorEvent::PaneLost { .. })).await;
        assert!(matches!(events.last(), Some(MonitorEvent::PaneLost { .. })));

        // Loop exits on its own after pane loss.
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_never_reclassified() {
        // The same prompt visible across many captures produces one event.
        let pane = Arc::new(FakePane::new(vec![
        Ok(vec!["Continue? (Y/n)"]),
            Ok(vec!["Continue? (Y/n)"]),
            Ok(vec!["Continue? (Y/n)"]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let (monitor, control) = PaneMonitor::new("s1", "app", pane, tx, test_config());
        tokio::spawn(monitor.run());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, MonitorEvent::Detected { .. }));

        // Give the loop time for several more polls, then stop; nothing
        // further should have been detected.
        tokio::time::sleep(Duration::from_millis(200)).await;
        control.stop();
        let mut extra = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, MonitorEvent::Detected { .. }) {
                extra += 1;
            }
        }
        assert_eq!(extra, 0);
    }
}
