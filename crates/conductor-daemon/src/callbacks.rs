//! Inline button callbacks
//!
//! Callback data is `prefix:verb:target`. Confirmations for destructive
//! actions are validated against the confirmation manager, so a stale
//! button tap after the TTL does nothing.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::telegram::format::mono;
use conductor_core::telegram::CallbackQuery;
use conductor_core::types::{Command, CommandSource};
use tracing::{info, warn};

use crate::app::App;

/// Delay before an `auto-resume in 15m` button fires.
const AUTO_RESUME_DELAY: Duration = Duration::from_secs(15 * 60);

pub async fn handle_callback(app: &Arc<App>, callback: CallbackQuery) {
    let Some(data) = callback.data.clone() else {
        return;
    };
    info!(data = %data, "Callback");

    let toast = match data.split(':').collect::<Vec<_>>().as_slice() {
        &["perm", verb, session_id] => on_permission(app, verb, session_id).await,
        &["rate", verb, session_id] => on_rate(app, verb, session_id).await,
        &["comp", verb, session_id] => on_completion(app, verb, session_id).await,
        &["confirm", verb, action, session_id] => {
            on_confirm(app, callback.from.id, verb, action, session_id).await
        }
        &["undo", session_id, _rule_id] => on_undo(app, session_id).await,
        &["suggest", index, session_id] => on_suggest(app, index, session_id).await,
        &["pick", session_id] => {
            *app.picked_session.lock().unwrap() = Some(session_id.to_string());
            Some("Now send your message.".to_string())
        }
        &["status", "refresh"] => {
            let body = conductor_core::telegram::format::format_dashboard(&app.sessions.list());
            app.notifier
                .send_immediate(
                    &body,
                    Some(conductor_core::telegram::keyboards::status_keyboard()),
                    true,
                )
                .await;
            None
        }
        _ => {
            warn!(data = %data, "Unroutable callback");
            None
        }
    };

    let _ = app.bot.answer_callback(&callback.id, toast.as_deref()).await;
}

async fn on_permission(app: &Arc<App>, verb: &str, session_id: &str) -> Option<String> {
    match verb {
        "yes" | "no" => {
            let input = if verb == "yes" { "y" } else { "n" };
            match app.sessions.send_input(session_id, input, true).await {
                Ok(()) => {
                    let _ = app.store.log_command(&Command::new(
                        session_id,
                        CommandSource::User,
                        input,
                        Some("permission button".to_string()),
                    ));
                    Some(format!("Sent '{input}'"))
                }
                Err(e) => Some(format!("Failed: {e}")),
            }
        }
        "ctx" => {
            let context = app
                .dispatcher
                .last_prompt_context(session_id)
                .unwrap_or_else(|| "No context remembered.".to_string());
            app.notifier
                .send_immediate(&format!("👀 Context:\n{}", mono(&context)), None, true)
                .await;
            None
        }
        "custom" => Some("Type your answer as a plain message.".to_string()),
        // `optN` buttons from a numbered choice list send the number.
        verb if verb.starts_with("opt") => {
            let Ok(number) = verb[3..].parse::<u32>() else {
                return None;
            };
            let input = number.to_string();
            match app.sessions.send_input(session_id, &input, true).await {
                Ok(()) => {
                    let _ = app.store.log_command(&Command::new(
                        session_id,
                        CommandSource::User,
                        &input,
                        Some("option button".to_string()),
                    ));
                    Some(format!("Sent '{input}'"))
                }
                Err(e) => Some(format!("Failed: {e}")),
            }
        }
        _ => None,
    }
}

async fn on_rate(app: &Arc<App>, verb: &str, session_id: &str) -> Option<String> {
    match verb {
        "resume" => match app.sessions.resume_session(session_id).await {
            Ok(session) => Some(format!("Resumed {}", session.alias)),
            Err(e) => Some(format!("Failed: {e}")),
        },
        "auto" => {
            let sessions = app.sessions.clone();
            let notifier = app.notifier.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_RESUME_DELAY).await;
                match sessions.resume_session(&id).await {
                    Ok(session) => {
                        notifier
                            .send_immediate(
                                &format!("▶️ Auto-resumed {}", session.label()),
                                None,
                                true,
                            )
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Auto-resume failed"),
                }
            });
            Some("Will resume in 15 minutes.".to_string())
        }
        "switch" => Some("Use /new to start another session meanwhile.".to_string()),
        _ => None,
    }
}

async fn on_completion(app: &Arc<App>, verb: &str, session_id: &str) -> Option<String> {
    match verb {
        "test" => match app.sessions.send_input(session_id, "run the tests", true).await {
            Ok(()) => {
                let _ = app.store.log_command(&Command::new(
                    session_id,
                    CommandSource::User,
                    "run the tests",
                    Some("completion button".to_string()),
                ));
                Some("Asked the session to run tests.".to_string())
            }
            Err(e) => Some(format!("Failed: {e}")),
        },
        "log" => {
            let events = app.store.get_events(Some(session_id), 10).unwrap_or_default();
            let body = if events.is_empty() {
                "No recent events.".to_string()
            } else {
                let mut out = String::from("📋 Recent events:\n");
                for event in events.iter().rev() {
                    out.push_str(&format!(
                        "• [{}] {}\n",
                        event.event_type.as_str(),
                        mono(event.message.chars().take(120).collect::<String>().as_str())
                    ));
                }
                out
            };
            app.notifier.send_immediate(&body, None, true).await;
            None
        }
        "new" => Some("Send the next task as a plain message.".to_string()),
        _ => None,
    }
}

async fn on_confirm(
    app: &Arc<App>,
    user_id: i64,
    verb: &str,
    action: &str,
    session_id: &str,
) -> Option<String> {
    if verb == "no" {
        app.confirmations.cancel(user_id, action, session_id);
        return Some("Cancelled.".to_string());
    }
    if !app.confirmations.confirm(user_id, action, session_id) {
        return Some("Confirmation expired — run the command again.".to_string());
    }

    match action {
        "kill" => match app.sessions.kill_session(session_id).await {
            Ok(session) => {
                app.notifier
                    .send_immediate(&format!("💀 Killed {}", session.label()), None, false)
                    .await;
                None
            }
            Err(e) => Some(format!("Failed: {e}")),
        },
        "restart" => {
            let old = app.sessions.get(session_id);
            match app.sessions.kill_session(session_id).await {
                Ok(_) => {}
                Err(e) => return Some(format!("Failed: {e}")),
            }
            let Some(old) = old else {
                return Some("Session record missing.".to_string());
            };
            match app
                .sessions
                .create_session(
                    old.session_type,
                    Some(&old.working_dir),
                    Some(&old.alias),
                )
                .await
            {
                Ok(session) => {
                    app.sessions.start_monitor(&session, app.events_tx.clone());
                    app.notifier
                        .send_immediate(
                            &format!("🔄 Restarted as {} #{}", session.label(), session.number),
                            None,
                            false,
                        )
                        .await;
                    None
                }
                Err(e) => Some(format!("Restart failed: {e}")),
            }
        }
        other => {
            warn!(action = other, "Unknown confirmable action");
            None
        }
    }
}

async fn on_undo(app: &Arc<App>, session_id: &str) -> Option<String> {
    match app.dispatcher.undo_auto_response(session_id).await {
        Ok(true) => Some("Interrupted the auto-response.".to_string()),
        Ok(false) => Some("Too late to undo.".to_string()),
        Err(e) => Some(format!("Undo failed: {e}")),
    }
}

async fn on_suggest(app: &Arc<App>, index: &str, session_id: &str) -> Option<String> {
    let Ok(index) = index.parse::<usize>() else {
        return None;
    };
    let Some(suggestion) = app.dispatcher.suggestion(session_id, index) else {
        return Some("Suggestion no longer available.".to_string());
    };
    match app
        .sessions
        .send_input(session_id, &suggestion.command, true)
        .await
    {
        Ok(()) => {
            let _ = app.store.log_command(&Command::new(
                session_id,
                CommandSource::User,
                &suggestion.command,
                Some("suggestion".to_string()),
            ));
            Some(format!("Running: {}", suggestion.label))
        }
        Err(e) => Some(format!("Failed: {e}")),
    }
}
