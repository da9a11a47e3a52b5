//! Event dispatcher
//!
//! The one component that knows every other component. Consumes classified
//! monitor events serially and routes them: permission and input prompts
//! to the user (or the auto-responder), rate limits to auto-pause, errors
//! to immediate notification, completions to the AI summarize/suggest
//! path and the token estimator. Also owns the short-lived conversational
//! state used to resolve which session a chat message targets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ai::{Brain, Suggestion};
use crate::auto::AutoResponder;
use crate::classify::DetectionKind;
use crate::db::Store;
use crate::notify::Notifier;
use crate::pane::MonitorEvent;
use crate::sessions::SessionManager;
use crate::telegram::format::{format_event, mono};
use crate::telegram::keyboards;
use crate::tokens::{ThresholdLevel, TokenEstimator};
use crate::types::{Command, CommandSource, Event, EventType, Session, SessionStatus};

/// How long the last prompting session is remembered for reply routing.
const LAST_PROMPT_WINDOW: Duration = Duration::from_secs(60);
/// Window in which an auto-response can be undone.
const UNDO_WINDOW: Duration = Duration::from_secs(30);
/// NL-parser guesses below this confidence are not trusted.
const NL_CONFIDENCE_FLOOR: f64 = 0.8;
/// Lines of context fed to summarize/suggest.
const SUMMARY_CONTEXT_LINES: usize = 50;

struct LastPrompt {
    session_id: String,
    at: Instant,
    context: String,
}

#[derive(Default)]
struct DispatchState {
    last_prompt: Option<LastPrompt>,
    suggestions: HashMap<String, Vec<Suggestion>>,
    auto_responses: HashMap<String, Instant>,
}

/// Outcome of resolving which session a free-text message targets.
#[derive(Debug)]
pub enum TargetResolution {
    Resolved(Session),
    /// Several candidates; the user has to pick.
    Ambiguous(Vec<Session>),
    NoSessions,
}

/// Central event router.
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    brain: Arc<Brain>,
    responder: Arc<AutoResponder>,
    estimator: Arc<TokenEstimator>,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        brain: Arc<Brain>,
        responder: Arc<AutoResponder>,
        estimator: Arc<TokenEstimator>,
    ) -> Self {
        Self {
            sessions,
            store,
            notifier,
            brain,
            responder,
            estimator,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Consume monitor events until the channel closes. Events are
    /// processed one at a time, so per-pane ordering is preserved.
    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<MonitorEvent>) {
        info!("Dispatcher started");
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        info!("Dispatcher stopped");
    }

    pub async fn handle_event(&self, event: MonitorEvent) {
        let session_id = event.session_id().to_string();
        let Some(session) = self.sessions.get(&session_id) else {
            warn!(session_id, "Event for unknown session");
            return;
        };
        self.sessions.touch_activity(&session.id);

        match event {
            MonitorEvent::Detected { result, lines, .. } => match result.kind {
                DetectionKind::PermissionPrompt => self.on_permission_prompt(&session, &lines).await,
                DetectionKind::InputPrompt => self.on_input_prompt(&session, &lines).await,
                DetectionKind::RateLimit => self.on_rate_limit(&session, &result.matched_text).await,
                DetectionKind::Error => self.on_error(&session, &lines).await,
                DetectionKind::Completion => self.on_completion(&session, &lines).await,
                DetectionKind::None => {}
            },
            MonitorEvent::CompletionCandidate { lines, .. } => {
                self.on_completion(&session, &lines).await;
            }
            MonitorEvent::PaneLost { .. } => self.on_pane_lost(&session).await,
        }
    }

    // ============ Per-kind handling ============

    async fn on_permission_prompt(&self, session: &Session, lines: &[String]) {
        self.notify_prompt(session, lines, keyboards::permission_keyboard(&session.id))
            .await;
    }

    /// Common path for anything the user has to answer: immediate
    /// notification, waiting status, input-required event, and the
    /// last-prompt memory that routes the reply back here.
    async fn notify_prompt(
        &self,
        session: &Session,
        lines: &[String],
        keyboard: crate::telegram::Keyboard,
    ) {
        let context = tail_text(lines, 10, 500);
        let body = format_event(
            "❓",
            Some(session),
            &format!("Waiting for input:\n\n{}", mono(&context)),
        );
        let silent = self.notifier.silent_for(EventType::InputRequired);
        let message_id = self
            .notifier
            .send_immediate(&body, Some(keyboard), silent)
            .await;

        let _ = self.sessions.set_status(&session.id, SessionStatus::Waiting);
        self.remember_prompt(&session.id, &context);
        let _ = self.store.log_event(
            &Event::new(Some(&session.id), EventType::InputRequired, &context)
                .with_platform_message_id(message_id),
        );
    }

    async fn on_input_prompt(&self, session: &Session, lines: &[String]) {
        let context = tail_text(lines, 10, 500);

        let decision = self.responder.check_and_respond(&context);
        if decision.respond {
            if let Err(e) = self
                .sessions
                .send_input(&session.id, &decision.response, true)
                .await
            {
                warn!(session = %session.alias, error = %e, "Auto-response delivery failed");
                return;
            }
            let rule_id = decision.rule_id.unwrap_or_default();
            let _ = self.store.log_command(&Command::new(
                &session.id,
                CommandSource::Auto,
                &decision.response,
                Some(format!("rule {rule_id}")),
            ));
            let _ = self.store.log_event(&Event::new(
                Some(&session.id),
                EventType::AutoResponse,
                &format!("Auto: {}", decision.response),
            ));
            self.state
                .lock()
                .unwrap()
                .auto_responses
                .insert(session.id.clone(), Instant::now());

            let shown = if decision.response.is_empty() {
                "(enter)".to_string()
            } else {
                decision.response.clone()
            };
            let body = format_event(
                "🤖",
                Some(session),
                &format!("Auto-responded: {}", mono(&shown)),
            );
            self.notifier
                .send(
                    EventType::AutoResponse,
                    &body,
                    Some(keyboards::undo_keyboard(&session.id, rule_id)),
                    true,
                )
                .await;
            return;
        }

        // Not auto-answerable: hand it to the user. A numbered choice
        // list gets one button per detected option.
        let options = extract_numbered_options(lines);
        let keyboard = if options.len() >= 2 {
            keyboards::options_keyboard(&session.id, &options)
        } else {
            keyboards::permission_keyboard(&session.id)
        };
        self.notify_prompt(session, lines, keyboard).await;
    }

    async fn on_rate_limit(&self, session: &Session, matched: &str) {
        if let Err(e) = self.sessions.rate_limit_session(&session.id).await {
            warn!(session = %session.alias, error = %e, "Auto-pause failed");
        }
        let body = format_event(
            "⚠️",
            Some(session),
            &format!("Rate limited — paused automatically.\n\n{}", mono(matched)),
        );
        let message_id = self
            .notifier
            .send_immediate(&body, Some(keyboards::rate_limit_keyboard(&session.id)), false)
            .await;
        let _ = self.store.log_event(
            &Event::new(Some(&session.id), EventType::RateLimit, matched)
                .with_platform_message_id(message_id),
        );
    }

    async fn on_error(&self, session: &Session, lines: &[String]) {
        let context = tail_text(lines, 10, 500);
        let body = format_event(
            "🔴",
            Some(session),
            &format!("Error detected\n\n{}", mono(&context)),
        );
        let silent = self.notifier.silent_for(EventType::Error);
        let message_id = self.notifier.send_immediate(&body, None, silent).await;
        let _ = self.sessions.set_status(&session.id, SessionStatus::Error);
        let _ = self.store.log_event(
            &Event::new(Some(&session.id), EventType::Error, &context)
                .with_platform_message_id(message_id),
        );
    }

    async fn on_completion(&self, session: &Session, lines: &[String]) {
        let output = lines
            .iter()
            .rev()
            .take(SUMMARY_CONTEXT_LINES)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let summary = self.brain.summarize(&output).await;
        let suggestions = self
            .brain
            .suggest(
                &output,
                &session.alias,
                session.session_type.as_str(),
                &session.working_dir,
            )
            .await;

        let _ = self.sessions.update_summary(&session.id, &summary);

        let keyboard = if suggestions.is_empty() {
            keyboards::completion_keyboard(&session.id)
        } else {
            keyboards::suggestion_keyboard(&suggestions, &session.id)
        };
        let mut body = format_event("✅", Some(session), &format!("Task complete\n\n{summary}"));
        if !suggestions.is_empty() {
            let labels: Vec<&str> = suggestions.iter().map(|s| s.label.as_str()).collect();
            body.push_str(&format!("\n\n💡 Suggested: {}", labels.join(", ")));
            self.state
                .lock()
                .unwrap()
                .suggestions
                .insert(session.id.clone(), suggestions);
        }
        let silent = self.notifier.silent_for(EventType::Completed);
        self.notifier
            .send(EventType::Completed, &body, Some(keyboard), silent)
            .await;
        let _ = self
            .store
            .log_event(&Event::new(Some(&session.id), EventType::Completed, &summary));

        // One response cycle per completion.
        self.estimator.record_response(&session.id);
        let used = self.estimator.usage(Some(&session.id)).used;
        self.sessions.record_token_use(&session.id, used);
        self.check_token_thresholds(session).await;
    }

    async fn check_token_thresholds(&self, session: &Session) {
        let Some(level) = self.estimator.check_thresholds() else {
            return;
        };
        let usage = self.estimator.usage(None);
        let body = format_event(
            "⚠️",
            Some(session),
            &format!("Token usage at {}% ({}/{})", usage.percentage, usage.used, usage.limit),
        );
        // Escalated levels are always audible.
        let silent = level == ThresholdLevel::Warning
            && self.notifier.silent_for(EventType::TokenWarning);
        self.notifier
            .send(EventType::TokenWarning, &body, None, silent)
            .await;
        let _ = self.store.log_event(&Event::new(
            Some(&session.id),
            EventType::TokenWarning,
            &format!("{}%", usage.percentage),
        ));

        // At the critical threshold the session is rate-limited within
        // this same dispatcher tick.
        if level == ThresholdLevel::Critical {
            if let Err(e) = self.sessions.rate_limit_session(&session.id).await {
                warn!(session = %session.alias, error = %e, "Critical-threshold pause failed");
            }
        }
    }

    async fn on_pane_lost(&self, session: &Session) {
        warn!(session = %session.alias, "Pane lost");
        let _ = self.sessions.mark_exited(&session.id);
        let body = format_event(
            "⚪",
            Some(session),
            "Session ended — its pane is gone.",
        );
        self.notifier.send_immediate(&body, None, false).await;
        let _ = self.store.log_event(&Event::new(
            Some(&session.id),
            EventType::System,
            "pane lost",
        ));
    }

    // ============ Conversational state ============

    fn remember_prompt(&self, session_id: &str, context: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_prompt = Some(LastPrompt {
            session_id: session_id.to_string(),
            at: Instant::now(),
            context: context.to_string(),
        });
    }

    /// Context of the most recent prompt for a session, if still fresh.
    pub fn last_prompt_context(&self, session_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .last_prompt
            .as_ref()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.context.clone())
    }

    /// Remembered suggestion for a `suggest:<idx>:` callback.
    pub fn suggestion(&self, session_id: &str, index: usize) -> Option<Suggestion> {
        let state = self.state.lock().unwrap();
        state
            .suggestions
            .get(session_id)
            .and_then(|list| list.get(index))
            .cloned()
    }

    /// Undo a recent auto-response with an interrupt keystroke. Returns
    /// false when the undo window has passed. Best effort by nature.
    pub async fn undo_auto_response(&self, session_id: &str) -> Result<bool> {
        let fresh = {
            let state = self.state.lock().unwrap();
            state
                .auto_responses
                .get(session_id)
                .is_some_and(|at| at.elapsed() <= UNDO_WINDOW)
        };
        if !fresh {
            return Ok(false);
        }
        if let Some(pane) = self.sessions.get_pane(session_id) {
            pane.interrupt()
                .await
                .map_err(|e| anyhow::anyhow!("interrupt failed: {e}"))?;
        }
        self.state.lock().unwrap().auto_responses.remove(session_id);
        let _ = self.store.log_command(&Command::new(
            session_id,
            CommandSource::User,
            "\u{3}",
            Some("undo".to_string()),
        ));
        Ok(true)
    }

    /// Which session does a free-text chat message target?
    ///
    /// Priority: fresh prompting session for reply-shaped text, explicit
    /// `#N`/alias reference, the only active session, then an NL-parser
    /// guess above the confidence floor.
    pub async fn resolve_target(&self, text: &str) -> TargetResolution {
        // 1. Recent prompt + reply-shaped message.
        if looks_like_reply(text) {
            let candidate = {
                let state = self.state.lock().unwrap();
                state
                    .last_prompt
                    .as_ref()
                    .filter(|p| p.at.elapsed() <= LAST_PROMPT_WINDOW)
                    .map(|p| p.session_id.clone())
            };
            if let Some(id) = candidate {
                if let Some(session) = self.sessions.get(&id) {
                    return TargetResolution::Resolved(session);
                }
            }
        }

        // 2. Explicit reference anywhere in the message.
        for word in text.split_whitespace() {
            if let Some(stripped) = word.strip_prefix('#') {
                if let Some(session) = self.sessions.resolve(stripped) {
                    return TargetResolution::Resolved(session);
                }
            }
        }
        if let Some(session) = self.sessions.resolve(text.trim()) {
            return TargetResolution::Resolved(session);
        }

        // 3. Only one session running.
        let active = self.sessions.list();
        match active.len() {
            0 => return TargetResolution::NoSessions,
            1 => return TargetResolution::Resolved(active[0].clone()),
            _ => {}
        }

        // 4. Ask the NL parser for a guess.
        let last_prompt = {
            let state = self.state.lock().unwrap();
            state
                .last_prompt
                .as_ref()
                .map(|p| p.context.clone())
                .unwrap_or_else(|| "None".to_string())
        };
        let parsed = self
            .brain
            .parse_nl(text, &self.sessions.session_list_json(), &last_prompt)
            .await;
        if parsed.confidence > NL_CONFIDENCE_FLOOR {
            if let Some(reference) = parsed.session {
                if let Some(session) = self.sessions.resolve(&reference) {
                    return TargetResolution::Resolved(session);
                }
            }
        }

        // 5. Give up; the caller shows a picker.
        TargetResolution::Ambiguous(active)
    }
}

/// Pull `N. label` / `N) label` choices out of a prompt.
fn extract_numbered_options(lines: &[String]) -> Vec<(u32, String)> {
    static OPTION_LINE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^\s*(\d+)[.)]\s+(.+)$").unwrap());
    let mut options = Vec::new();
    for line in lines {
        if let Some(captures) = OPTION_LINE.captures(line) {
            if let Ok(number) = captures[1].parse::<u32>() {
                options.push((number, captures[2].trim().to_string()));
            }
        }
    }
    options
}

/// Last `lines` lines joined, truncated to `max_chars`.
fn tail_text(lines: &[String], count: usize, max_chars: usize) -> String {
    let start = lines.len().saturating_sub(count);
    let text = lines[start..].join("\n");
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect()
    } else {
        text
    }
}

/// Short y/n/digit-shaped messages are treated as replies to the most
/// recent prompt.
fn looks_like_reply(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') {
        return false;
    }
    let lower = trimmed.to_lowercase();
    matches!(lower.as_str(), "y" | "n" | "yes" | "no")
        || trimmed.chars().all(|c| c.is_ascii_digit())
        || trimmed.chars().count() <= 5
}
