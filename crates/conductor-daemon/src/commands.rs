//! Slash commands and free-text routing
//!
//! Only the commands that alter core state carry real logic here:
//! pause/resume, auto-rule management, kill/restart behind the
//! confirmation manager, and input delivery. Everything else is a thin
//! formatting wrapper over the managers.

use std::sync::Arc;

use conductor_core::dispatch::TargetResolution;
use conductor_core::telegram::format::{self, mono};
use conductor_core::telegram::keyboards;
use conductor_core::types::{Command, CommandSource, MatchType, SessionType};
use tracing::info;

use crate::app::App;

const HELP: &str = "<b>Conductor commands</b>\n\
/status — session dashboard\n\
/digest — dashboard + token usage\n\
/new &lt;cc|sh&gt; &lt;dir&gt; — create session\n\
/input &lt;session&gt; &lt;text&gt; — send text to session\n\
/run &lt;session&gt; &lt;command&gt; — run command in session\n\
/shell &lt;command&gt; — one-off shell command\n\
/output [session] — recent summary\n\
/log [session] — recent commands\n\
/tokens — token usage overview\n\
/pause [session] — pause session or auto-responder\n\
/resume [session] — resume session or auto-responder\n\
/kill &lt;session&gt; — kill session (confirmed)\n\
/restart &lt;session&gt; — restart session (confirmed)\n\
/rename &lt;session&gt; &lt;alias&gt; — rename session\n\
/auto list|add|remove|on|off — auto-responder rules\n\
/quiet — quiet hours status\n\
/settings — active configuration\n\
/help — this text";

/// Deadline for one-off shell commands.
const SHELL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Route one slash command. Replies go through the notifier's immediate
/// path so they are never batched behind event traffic.
pub async fn handle_command(app: &Arc<App>, user_id: i64, text: &str) {
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or("").trim();

    let reply = match command {
        "/start" | "/help" => HELP.to_string(),
        "/status" => {
            let sessions = app.sessions.list();
            let body = format::format_dashboard(&sessions);
            app.notifier
                .send_immediate(&body, Some(keyboards::status_keyboard()), true)
                .await;
            return;
        }
        "/new" => cmd_new(app, args).await,
        "/input" => cmd_input(app, args, false).await,
        "/run" => cmd_input(app, args, true).await,
        "/shell" => cmd_shell(args).await,
        "/output" => cmd_output(app, args),
        "/log" => cmd_log(app, args),
        "/tokens" => cmd_tokens(app),
        "/digest" => {
            let mut body = format::format_dashboard(&app.sessions.list());
            body.push_str("\n\n");
            body.push_str(&cmd_tokens(app));
            body
        }
        "/quiet" => cmd_quiet(app),
        "/settings" => cmd_settings(app),
        "/pause" => cmd_pause(app, args).await,
        "/resume" => cmd_resume(app, args).await,
        "/kill" => cmd_destructive(app, user_id, "kill", args).await,
        "/restart" => cmd_destructive(app, user_id, "restart", args).await,
        "/rename" => cmd_rename(app, args),
        "/auto" => cmd_auto(app, args),
        _ => format!("Unknown command {}. Try /help.", format::escape(command)),
    };
    // Some commands (confirmations) reply through their own keyboard.
    if !reply.is_empty() {
        app.notifier.send_immediate(&reply, None, true).await;
    }
}

async fn cmd_new(app: &Arc<App>, args: &str) -> String {
    let mut parts = args.split_whitespace();
    let session_type = parts
        .next()
        .and_then(SessionType::parse)
        .unwrap_or(SessionType::ClaudeCode);
    let dir = parts.next();

    match app.sessions.create_session(session_type, dir, None).await {
        Ok(session) => {
            app.sessions.start_monitor(&session, app.events_tx.clone());
            format!(
                "📦 Created {} #{} ({}) in {}",
                session.label(),
                session.number,
                session.session_type.as_str(),
                mono(&session.working_dir)
            )
        }
        Err(e) => format!("❌ {e}"),
    }
}

async fn cmd_input(app: &Arc<App>, args: &str, is_shell_command: bool) -> String {
    let mut parts = args.splitn(2, char::is_whitespace);
    let (identifier, text) = match (parts.next(), parts.next()) {
        (Some(id), Some(text)) if !text.trim().is_empty() => (id, text.trim()),
        _ => return "Usage: /input &lt;session&gt; &lt;text&gt;".to_string(),
    };
    let Some(session) = app.sessions.resolve(identifier) else {
        return format!("No session matching {}", mono(identifier));
    };
    match app.sessions.send_input(&session.id, text, true).await {
        Ok(()) => {
            let context = if is_shell_command { "run" } else { "input" };
            let _ = app.store.log_command(&Command::new(
                &session.id,
                CommandSource::User,
                text,
                Some(context.to_string()),
            ));
            format!("📤 Sent to {}: {}", session.label(), mono(text))
        }
        Err(e) => format!("❌ {e}"),
    }
}

/// One-off shell command outside any session, with a hard deadline.
async fn cmd_shell(args: &str) -> String {
    if args.is_empty() {
        return "Usage: /shell &lt;command&gt;".to_string();
    }
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(args)
        .output();
    match tokio::time::timeout(SHELL_TIMEOUT, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            let total = text.chars().count();
            let tail: String = text.chars().skip(total.saturating_sub(3000)).collect();
            format!(
                "💻 {} (exit {})\n{}",
                mono(args),
                output.status.code().unwrap_or(-1),
                mono(tail.trim())
            )
        }
        Ok(Err(e)) => format!("❌ {e}"),
        Err(_) => "❌ Command timed out after 30s.".to_string(),
    }
}

fn cmd_log(app: &Arc<App>, args: &str) -> String {
    let session = if args.is_empty() {
        app.sessions.list().into_iter().next()
    } else {
        app.sessions.resolve(args)
    };
    let Some(session) = session else {
        return "No matching session.".to_string();
    };
    let commands = app.store.get_commands(&session.id, 15).unwrap_or_default();
    if commands.is_empty() {
        return format!("📜 {} — no commands yet", session.label());
    }
    let mut out = format!("📜 {} — recent commands:\n", session.label());
    for command in commands.iter().rev() {
        out.push_str(&format!(
            "• [{}] {}\n",
            command.source.as_str(),
            mono(&command.input)
        ));
    }
    out
}

fn cmd_quiet(app: &Arc<App>) -> String {
    let quiet = &app.config.prefs.notifications.quiet_hours;
    if !quiet.enabled {
        return "🔔 Quiet hours are off. Enable them in config.yaml under notifications.quiet_hours.".to_string();
    }
    format!(
        "🔕 Quiet hours {}–{} ({}). Completion and token notices are held; prompts and errors still come through.",
        quiet.start, quiet.end, quiet.timezone
    )
}

fn cmd_settings(app: &Arc<App>) -> String {
    let prefs = &app.config.prefs;
    format!(
        "⚙️ <b>Configuration</b>\n\
         Sessions: max {} concurrent, default {}\n\
         Plan tier: {} ({} msgs / {}h window)\n\
         Poll: {}ms default / {}ms active / {}ms idle\n\
         Batch window: {}s, confirmation TTL: {}s\n\
         Auto-responder: {}\n\
         AI model: {}",
        prefs.sessions.max_concurrent,
        prefs.sessions.default_type,
        prefs.tokens.plan_tier,
        app.estimator.tier_limit(),
        prefs.tokens.window_hours,
        prefs.monitor.poll_interval_ms,
        prefs.monitor.active_poll_interval_ms,
        prefs.monitor.idle_poll_interval_ms,
        prefs.notifications.batch_window_s,
        prefs.notifications.confirmation_timeout_s,
        if app.responder.is_paused() { "paused" } else { "active" },
        prefs.ai.model,
    )
}

fn cmd_output(app: &Arc<App>, args: &str) -> String {
    let session = if args.is_empty() {
        app.sessions.list().into_iter().next()
    } else {
        app.sessions.resolve(args)
    };
    match session {
        Some(session) => match &session.last_summary {
            Some(summary) => format!("📝 {}\n{summary}", session.label()),
            None => format!("📝 {} — no summary yet", session.label()),
        },
        None => "No matching session.".to_string(),
    }
}

fn cmd_tokens(app: &Arc<App>) -> String {
    let usage = app.estimator.usage(None);
    let mut out = format!(
        "📈 <b>Token usage</b> ({} tier)\nTotal: {}\n",
        usage.tier,
        format::token_bar(usage.used, usage.limit)
    );
    if let Some(reset) = usage.reset_in_seconds {
        out.push_str(&format!("Window resets in {}m\n", reset / 60));
    }
    for session in app.sessions.list() {
        let per = app.estimator.usage(Some(&session.id));
        out.push_str(&format!("{} — {} messages\n", session.label(), per.used));
    }
    out
}

async fn cmd_pause(app: &Arc<App>, args: &str) -> String {
    if args.is_empty() {
        app.responder.pause();
        return "⏸ Auto-responder paused.".to_string();
    }
    let Some(session) = app.sessions.resolve(args) else {
        return format!("No session matching {}", mono(args));
    };
    match app.sessions.pause_session(&session.id).await {
        Ok(session) => format!("⏸ Paused {}", session.label()),
        Err(e) => format!("❌ {e}"),
    }
}

async fn cmd_resume(app: &Arc<App>, args: &str) -> String {
    if args.is_empty() {
        app.responder.resume();
        return "▶️ Auto-responder resumed.".to_string();
    }
    let Some(session) = app.sessions.resolve(args) else {
        return format!("No session matching {}", mono(args));
    };
    match app.sessions.resume_session(&session.id).await {
        Ok(session) => format!("▶️ Resumed {}", session.label()),
        Err(e) => format!("❌ {e}"),
    }
}

/// Kill and restart want a second tap: register the pending action and
/// put a confirm keyboard under the question.
async fn cmd_destructive(app: &Arc<App>, user_id: i64, action: &str, args: &str) -> String {
    let Some(session) = app.sessions.resolve(args) else {
        return format!("Usage: /{action} &lt;session&gt;");
    };
    app.confirmations.request(user_id, action, &session.id);
    let body = format!(
        "⚠️ Really {action} {}? This cannot be undone.",
        session.label()
    );
    app.notifier
        .send_immediate(&body, Some(keyboards::confirm_keyboard(action, &session.id)), false)
        .await;
    String::new()
}

fn cmd_rename(app: &Arc<App>, args: &str) -> String {
    let mut parts = args.splitn(2, char::is_whitespace);
    let (identifier, alias) = match (parts.next(), parts.next()) {
        (Some(id), Some(alias)) if !alias.trim().is_empty() => (id, alias.trim()),
        _ => return "Usage: /rename &lt;session&gt; &lt;alias&gt;".to_string(),
    };
    let Some(session) = app.sessions.resolve(identifier) else {
        return format!("No session matching {}", mono(identifier));
    };
    match app.sessions.rename_session(&session.id, alias) {
        Ok(session) => format!("✏️ Renamed to {}", session.label()),
        Err(e) => format!("❌ {e}"),
    }
}

fn cmd_auto(app: &Arc<App>, args: &str) -> String {
    let mut parts = args.splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("list");
    let rest = parts.next().unwrap_or("").trim();

    match sub {
        "list" | "" => {
            let rules = match app.store.get_rules(false) {
                Ok(rules) => rules,
                Err(e) => return format!("❌ {e}"),
            };
            if rules.is_empty() {
                return "🤖 No auto-response rules.".to_string();
            }
            let state = if app.responder.is_paused() { "paused" } else { "active" };
            let mut out = format!("🤖 <b>Auto-responder</b> ({state})\n");
            for rule in rules {
                let marker = if rule.enabled { "✅" } else { "🚫" };
                out.push_str(&format!(
                    "{marker} #{} {} → {} ({}, {} hits)\n",
                    rule.id,
                    mono(&rule.pattern),
                    mono(&rule.response),
                    rule.match_type.as_str(),
                    rule.hit_count
                ));
            }
            out
        }
        "add" => {
            // /auto add <pattern> -> <response>
            let Some((pattern, response)) = rest.split_once("->") else {
                return "Usage: /auto add &lt;pattern&gt; -&gt; &lt;response&gt;".to_string();
            };
            match app
                .store
                .add_rule(pattern.trim(), response.trim(), MatchType::Contains)
            {
                Ok(id) => format!("✅ Rule #{id} added."),
                Err(e) => format!("❌ {e}"),
            }
        }
        "remove" => match rest.parse::<i64>() {
            Ok(id) => match app.store.delete_rule(id) {
                Ok(true) => format!("🗑 Rule #{id} removed."),
                Ok(false) => format!("No rule #{id}."),
                Err(e) => format!("❌ {e}"),
            },
            Err(_) => "Usage: /auto remove &lt;id&gt;".to_string(),
        },
        "on" => {
            app.responder.resume();
            let _ = app.store.set_rules_enabled(true);
            "🤖 Auto-responder enabled.".to_string()
        }
        "off" => {
            app.responder.pause();
            "🤖 Auto-responder disabled.".to_string()
        }
        other => format!("Unknown subcommand {}.", mono(other)),
    }
}

// ============ Free text ============

/// Non-command text: a picked session wins, then the dispatcher's
/// resolution order; an NL-parser command above the confidence floor is
/// executed instead of forwarded.
pub async fn handle_natural(app: &Arc<App>, user_id: i64, text: &str) {
    // A prior pick: button binds the next message, once.
    let picked = app.picked_session.lock().unwrap().take();
    if let Some(id) = picked {
        if let Some(session) = app.sessions.get(&id) {
            forward_to_session(app, &session.id, text).await;
            return;
        }
    }

    match app.dispatcher.resolve_target(text).await {
        TargetResolution::Resolved(session) => {
            // Command-shaped text gets one NL-parse attempt before being
            // forwarded as raw input.
            if text.split_whitespace().count() > 1 {
                let parsed = app
                    .brain
                    .parse_nl(text, &app.sessions.session_list_json(), "None")
                    .await;
                if parsed.confidence > 0.8 && parsed.command != "unknown" && parsed.command != "input"
                {
                    run_parsed_command(app, user_id, &parsed.command, parsed.session.as_deref())
                        .await;
                    return;
                }
            }
            forward_to_session(app, &session.id, text).await;
        }
        TargetResolution::NoSessions => {
            app.notifier
                .send_immediate("No active sessions. Use /new to start one.", None, true)
                .await;
        }
        TargetResolution::Ambiguous(sessions) => {
            app.notifier
                .send_immediate(
                    "Which session do you mean?",
                    Some(keyboards::pick_keyboard(&sessions)),
                    true,
                )
                .await;
        }
    }
}

async fn forward_to_session(app: &Arc<App>, session_id: &str, text: &str) {
    let Some(session) = app.sessions.get(session_id) else {
        return;
    };
    match app.sessions.send_input(session_id, text, true).await {
        Ok(()) => {
            let _ = app.store.log_command(&Command::new(
                session_id,
                CommandSource::User,
                text,
                None,
            ));
            info!(session = %session.alias, "Forwarded message to pane");
            app.notifier
                .send_immediate(
                    &format!("📤 Sent to {}: {}", session.label(), mono(text)),
                    None,
                    true,
                )
                .await;
        }
        Err(e) => {
            app.notifier
                .send_immediate(&format!("❌ {e}"), None, true)
                .await;
        }
    }
}

async fn run_parsed_command(app: &Arc<App>, user_id: i64, command: &str, session: Option<&str>) {
    let args = session.unwrap_or("");
    let line = match command {
        "status" => "/status".to_string(),
        "tokens" => "/tokens".to_string(),
        "kill" => format!("/kill {args}"),
        "restart" => format!("/restart {args}"),
        "pause" => format!("/pause {args}"),
        "resume" => format!("/resume {args}"),
        "output" => format!("/output {args}"),
        _ => {
            app.notifier
                .send_immediate("Not sure what you meant — try /help.", None, true)
                .await;
            return;
        }
    };
    handle_command(app, user_id, line.trim()).await;
}
