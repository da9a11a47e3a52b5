//! Notifier
//!
//! Owns everything between "a component wants the user to know" and the
//! chat platform: redaction, batching of non-urgent messages, quiet
//! hours, retry with backoff, and an offline queue drained once the
//! platform is reachable again. Transport failures are absorbed here and
//! never propagate to callers.

pub mod redact;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::NotificationsConfig;
use crate::errors::{ErrorEscalator, ErrorKind};
use crate::telegram::{ChatTransport, Keyboard, TransportError};
use crate::types::EventType;

/// Liveness probe period while offline.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
/// Pause between drained messages, to respect downstream rate limits.
const DRAIN_DELAY: Duration = Duration::from_millis(100);
/// Direct-send attempts before a message goes to the offline queue.
const SEND_ATTEMPTS: u32 = 4;
/// Redeliveries per queued message before it is dropped.
const MAX_QUEUE_RETRIES: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Outgoing {
    text: String,
    keyboard: Option<Keyboard>,
    silent: bool,
}

#[derive(Debug, Clone)]
struct Queued {
    message: Outgoing,
    retries: u32,
}

/// Batching, redacting, offline-resilient notification sender.
pub struct Notifier {
    transport: Arc<dyn ChatTransport>,
    config: NotificationsConfig,
    escalator: Arc<ErrorEscalator>,
    batch: Mutex<Vec<Outgoing>>,
    offline_queue: Mutex<VecDeque<Queued>>,
    online: AtomicBool,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        config: NotificationsConfig,
        escalator: Arc<ErrorEscalator>,
    ) -> Self {
        Self {
            transport,
            config,
            escalator,
            batch: Mutex::new(Vec::new()),
            offline_queue: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Should a notification of this type go out without a sound?
    /// Driven by the `notifications.sounds` preferences.
    pub fn silent_for(&self, event_type: EventType) -> bool {
        let sounds = &self.config.sounds;
        match event_type {
            EventType::InputRequired => !sounds.input_required,
            EventType::TokenWarning => !sounds.token_warning,
            EventType::Error => !sounds.error,
            EventType::Completed => !sounds.completed,
            EventType::AutoResponse => true,
            EventType::RateLimit | EventType::System => false,
        }
    }

    /// Send now, bypassing batching and quiet hours. Redaction and the
    /// offline queue still apply. Returns the platform message id when
    /// the send went through.
    pub async fn send_immediate(
        &self,
        text: &str,
        keyboard: Option<Keyboard>,
        silent: bool,
    ) -> Option<i64> {
        let message = Outgoing {
            text: redact::redact(text),
            keyboard,
            silent,
        };
        self.send_direct(message).await
    }

    /// Queue a non-urgent notification for the next batch flush. During
    /// quiet hours, completion and token-warning traffic is dropped here
    /// (the event row is still persisted by the caller).
    pub async fn send(&self, event_type: EventType, text: &str, keyboard: Option<Keyboard>, silent: bool) {
        if self.in_quiet_hours()
            && matches!(event_type, EventType::Completed | EventType::TokenWarning)
        {
            debug!(event_type = event_type.as_str(), "Dropped during quiet hours");
            return;
        }
        let message = Outgoing {
            text: redact::redact(text),
            keyboard,
            silent,
        };
        if self.config.batch_window_s == 0 {
            self.send_direct(message).await;
            return;
        }
        self.batch.lock().await.push(message);
    }

    /// Background loop flushing the batch buffer on the configured window.
    pub async fn run_batch_flusher(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let window = Duration::from_secs(self.config.batch_window_s.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    self.flush_batch().await;
                }
                _ = shutdown.changed() => {
                    // Best-effort final flush, bounded.
                    let _ = tokio::time::timeout(Duration::from_secs(2), self.flush_batch()).await;
                    return;
                }
            }
        }
    }

    /// Background loop probing the platform while offline and draining
    /// the queue once it answers.
    pub async fn run_liveness_checker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(LIVENESS_INTERVAL) => {
                    if !self.is_online() && self.transport.check_alive().await.is_ok() {
                        info!("Platform reachable again");
                        self.online.store(true, Ordering::SeqCst);
                        self.drain_offline_queue().await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Flush buffered messages: one message goes out as-is, several are
    /// combined in arrival order. Keyboard-bearing messages are sent
    /// individually so their buttons survive.
    pub async fn flush_batch(&self) {
        let items: Vec<Outgoing> = {
            let mut batch = self.batch.lock().await;
            batch.drain(..).collect()
        };
        if items.is_empty() {
            return;
        }
        if items.len() == 1 {
            self.send_direct(items.into_iter().next().unwrap()).await;
            return;
        }

        let (with_keyboard, plain): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|m| m.keyboard.is_some());

        match plain.len() {
            0 => {}
            1 => {
                self.send_direct(plain.into_iter().next().unwrap()).await;
            }
            n => {
                let silent = plain.iter().all(|m| m.silent);
                let combined = format!(
                    "📬 {n} Updates:\n\n{}",
                    plain
                        .iter()
                        .map(|m| m.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n")
                );
                self.send_direct(Outgoing {
                    text: combined,
                    keyboard: None,
                    silent,
                })
                .await;
            }
        }

        for message in with_keyboard {
            self.send_direct(message).await;
        }
    }

    async fn send_direct(&self, message: Outgoing) -> Option<i64> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 0..SEND_ATTEMPTS {
            match self
                .transport
                .send_message(&message.text, message.keyboard.as_ref(), message.silent)
                .await
            {
                Ok(message_id) => {
                    if !self.is_online() {
                        self.online.store(true, Ordering::SeqCst);
                    }
                    self.drain_offline_queue().await;
                    return Some(message_id);
                }
                Err(TransportError::Throttled { retry_after }) => {
                    self.escalator.record(ErrorKind::TransportThrottled, "notifier");
                    let wait = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(backoff)
                        .min(BACKOFF_CAP);
                    warn!(attempt, wait_secs = wait.as_secs(), "Platform throttled, backing off");
                    tokio::time::sleep(wait).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(TransportError::AuthDenied) => {
                    self.escalator.record(ErrorKind::AuthDenied, "notifier");
                    return None;
                }
                Err(TransportError::Unreachable(e)) => {
                    self.escalator.record(ErrorKind::TransportUnreachable, "notifier");
                    warn!(error = %e, "Platform unreachable, queueing message");
                    self.online.store(false, Ordering::SeqCst);
                    self.enqueue_offline(message, 1).await;
                    return None;
                }
            }
        }
        // Throttled through every attempt: keep the message for later.
        self.enqueue_offline(message, 1).await;
        None
    }

    async fn enqueue_offline(&self, message: Outgoing, retries: u32) {
        let mut queue = self.offline_queue.lock().await;
        queue.push_back(Queued { message, retries });
        debug!(queued = queue.len(), "Offline queue grew");
    }

    /// Deliver queued messages in FIFO order. Stops at the first failure
    /// and requeues the message at the front, so order is preserved
    /// across reconnects.
    async fn drain_offline_queue(&self) {
        loop {
            // Pop under the lock, send without it.
            let next = {
                let mut queue = self.offline_queue.lock().await;
                queue.pop_front()
            };
            let Some(entry) = next else { return };

            match self
                .transport
                .send_message(
                    &entry.message.text,
                    entry.message.keyboard.as_ref(),
                    entry.message.silent,
                )
                .await
            {
                Ok(_) => {
                    tokio::time::sleep(DRAIN_DELAY).await;
                }
                Err(_) => {
                    self.online.store(false, Ordering::SeqCst);
                    if entry.retries < MAX_QUEUE_RETRIES {
                        let mut queue = self.offline_queue.lock().await;
                        queue.push_front(Queued {
                            message: entry.message,
                            retries: entry.retries + 1,
                        });
                    } else {
                        warn!(retries = entry.retries, "Discarding undeliverable message");
                    }
                    return;
                }
            }
        }
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    fn in_quiet_hours(&self) -> bool {
        let quiet = &self.config.quiet_hours;
        if !quiet.enabled {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&quiet.start), parse_hhmm(&quiet.end)) else {
            return false;
        };
        let now = Local::now();
        let minutes = now.hour() * 60 + now.minute();
        minutes_in_window(minutes, start, end)
    }
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Window membership, handling windows that wrap midnight.
fn minutes_in_window(now: u32, start: u32, end: u32) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::button;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Transport that records sends and can be scripted to fail.
    struct MockTransport {
        sent: StdMutex<Vec<String>>,
        fail_next: AtomicUsize,
        next_id: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                fail_next: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
            })
        }

        fn fail_times(&self, n: usize) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(
            &self,
            text: &str,
            _keyboard: Option<&Keyboard>,
            _silent: bool,
        ) -> Result<i64, TransportError> {
            let failures = self.fail_next.load(Ordering::SeqCst);
            if failures > 0 {
                self.fail_next.store(failures - 1, Ordering::SeqCst);
                return Err(TransportError::Unreachable("down".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) as i64)
        }

        async fn check_alive(&self) -> Result<(), TransportError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                return Err(TransportError::Unreachable("down".to_string()));
            }
            Ok(())
        }
    }

    fn notifier(transport: Arc<MockTransport>, config: NotificationsConfig) -> Arc<Notifier> {
        let (escalator, _rx) = ErrorEscalator::new();
        Arc::new(Notifier::new(transport, config, Arc::new(escalator)))
    }

    #[tokio::test]
    async fn test_send_immediate_redacts() {
        let transport = MockTransport::new();
        let notifier = notifier(transport.clone(), NotificationsConfig::default());
        let id = notifier
            .send_immediate("key sk-ant-api03-secret123 leaked", None, false)
            .await;
        assert!(id.is_some());
        let sent = transport.sent();
        assert!(sent[0].contains("[REDACTED:ANTHROPIC_KEY]"));
        assert!(!sent[0].contains("secret123"));
    }

    #[tokio::test]
    async fn test_batch_combines_in_arrival_order() {
        let transport = MockTransport::new();
        let notifier = notifier(transport.clone(), NotificationsConfig::default());

        notifier.send(EventType::Completed, "first done", None, true).await;
        notifier.send(EventType::Completed, "second done", None, true).await;
        notifier.send(EventType::Completed, "third done", None, true).await;
        notifier.flush_batch().await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("📬 3 Updates:"));
        let first = sent[0].find("first done").unwrap();
        let second = sent[0].find("second done").unwrap();
        let third = sent[0].find("third done").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn test_single_batched_message_sent_as_is() {
        let transport = MockTransport::new();
        let notifier = notifier(transport.clone(), NotificationsConfig::default());
        notifier.send(EventType::Completed, "only one", None, false).await;
        notifier.flush_batch().await;
        assert_eq!(transport.sent(), vec!["only one".to_string()]);
    }

    #[tokio::test]
    async fn test_keyboard_messages_not_combined() {
        let transport = MockTransport::new();
        let notifier = notifier(transport.clone(), NotificationsConfig::default());
        let keyboard = Keyboard::new().row(vec![button("Undo", "undo:s1:1")]);
        notifier.send(EventType::AutoResponse, "auto: y", Some(keyboard), true).await;
        notifier.send(EventType::Completed, "a done", None, true).await;
        notifier.send(EventType::Completed, "b done", None, true).await;
        notifier.flush_batch().await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("📬 2 Updates:"));
        assert_eq!(sent[1], "auto: y");
    }

    #[tokio::test]
    async fn test_offline_queue_fifo_across_reconnects() {
        let transport = MockTransport::new();
        let notifier = notifier(transport.clone(), NotificationsConfig::default());

        transport.fail_times(3);
        notifier.send_immediate("msg 1", None, false).await;
        notifier.send_immediate("msg 2", None, false).await;
        notifier.send_immediate("msg 3", None, false).await;
        assert!(!notifier.is_online());
        assert_eq!(notifier.offline_queue_len().await, 3);
        assert!(transport.sent().is_empty());

        // Transport recovers; the next send drains the queue first-in
        // first-out, then nothing is left behind.
        notifier.send_immediate("msg 4", None, false).await;
        let sent = transport.sent();
        assert_eq!(sent, vec!["msg 4", "msg 1", "msg 2", "msg 3"]);
        assert_eq!(notifier.offline_queue_len().await, 0);
        assert!(notifier.is_online());
    }

    #[tokio::test]
    async fn test_quiet_hours_drop_non_urgent_only() {
        let transport = MockTransport::new();
        let config = NotificationsConfig {
            quiet_hours: QuietHoursConfigAlways::always(),
            ..NotificationsConfig::default()
        };
        let notifier = notifier(transport.clone(), config);

        notifier.send(EventType::Completed, "done", None, true).await;
        notifier.send(EventType::TokenWarning, "80%", None, true).await;
        notifier.send(EventType::AutoResponse, "auto", None, true).await;
        notifier.flush_batch().await;

        // Immediate path ignores quiet hours entirely.
        notifier.send_immediate("urgent error", None, false).await;

        let sent = transport.sent();
        assert_eq!(sent, vec!["auto", "urgent error"]);
    }

    #[tokio::test]
    async fn test_zero_batch_window_sends_immediately() {
        let transport = MockTransport::new();
        let config = NotificationsConfig {
            batch_window_s: 0,
            ..NotificationsConfig::default()
        };
        let notifier = notifier(transport.clone(), config);
        notifier.send(EventType::Completed, "instant", None, true).await;
        assert_eq!(transport.sent(), vec!["instant"]);
    }

    #[test]
    fn test_minutes_in_window() {
        // plain window 22:00-07:00 wraps midnight
        let start = 22 * 60;
        let end = 7 * 60;
        assert!(minutes_in_window(23 * 60, start, end));
        assert!(minutes_in_window(3 * 60, start, end));
        assert!(!minutes_in_window(12 * 60, start, end));
        // non-wrapping window
        assert!(minutes_in_window(10 * 60, 9 * 60, 17 * 60));
        assert!(!minutes_in_window(18 * 60, 9 * 60, 17 * 60));
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("07:30"), Some(450));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("oops"), None);
    }

    /// Helper building a quiet-hours window that always matches.
    struct QuietHoursConfigAlways;

    impl QuietHoursConfigAlways {
        fn always() -> crate::config::QuietHoursConfig {
            crate::config::QuietHoursConfig {
                enabled: true,
                start: "00:00".to_string(),
                end: "23:59".to_string(),
                timezone: "local".to_string(),
            }
        }
    }
}
