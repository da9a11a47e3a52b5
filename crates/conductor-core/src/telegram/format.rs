//! Message formatting
//!
//! HTML parse mode throughout. Session labels carry the color token so
//! parallel sessions stay tellable apart on a phone screen.

use chrono::{DateTime, Utc};

use crate::types::{Session, SessionStatus};

pub fn mono(text: &str) -> String {
    format!("<code>{}</code>", escape(text))
}

pub fn bold(text: &str) -> String {
    format!("<b>{}</b>", escape(text))
}

/// Escape the three characters HTML parse mode cares about.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// One-line status for a session.
pub fn status_line(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "🟢 Running",
        SessionStatus::Paused => "⏸ Paused",
        SessionStatus::Waiting => "⏸ WAITING FOR INPUT",
        SessionStatus::Error => "🔴 Error",
        SessionStatus::Exited => "⚪ Exited",
        SessionStatus::RateLimited => "🟡 Rate Limited",
    }
}

/// `3h 07m` style uptime from an RFC 3339 creation timestamp.
pub fn uptime(created_at: &str) -> String {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(created) => {
            let elapsed = Utc::now().signed_duration_since(created.with_timezone(&Utc));
            let hours = elapsed.num_hours();
            let minutes = elapsed.num_minutes() % 60;
            format!("{hours}h {minutes:02}m")
        }
        Err(_) => "unknown".to_string(),
    }
}

/// `42% (19 / 45)` with a warning marker from 80%.
pub fn token_bar(used: i64, limit: i64) -> String {
    if limit <= 0 {
        return "N/A".to_string();
    }
    let pct = ((used * 100) / limit).min(100);
    let warn = if pct >= 80 { " ⚠️" } else { "" };
    format!("{pct}% ({used} / {limit}){warn}")
}

/// Event notification body: emoji + session label + text.
pub fn format_event(emoji: &str, session: Option<&Session>, text: &str) -> String {
    match session {
        Some(session) => format!("{emoji} {}\n{text}", session.label()),
        None => format!("{emoji} {text}"),
    }
}

fn session_block(session: &Session) -> String {
    let mut lines = vec![
        format!(
            "<b>{} #{} {}</b> ({})",
            session.color_token,
            session.number,
            escape(&session.alias),
            session.session_type.as_str()
        ),
        format!("   ├ Status: {}", status_line(session.status)),
        format!("   ├ Tokens: {}", token_bar(session.token_used, session.token_limit)),
        format!("   ├ Uptime: {}", uptime(&session.created_at)),
    ];
    if let Some(summary) = &session.last_summary {
        lines.push(format!("   └ Last: \"{}\"", escape(summary)));
    } else if let Some(activity) = &session.last_activity {
        lines.push(format!("   └ Last activity: {activity}"));
    } else {
        lines.push("   └ Last: No activity yet".to_string());
    }
    lines.join("\n")
}

/// The `/status` dashboard.
pub fn format_dashboard(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "📊 <b>Conductor Status</b> — No active sessions\n\nUse /new to start a session."
            .to_string();
    }
    let plural = if sessions.len() == 1 { "" } else { "s" };
    let mut out = format!(
        "📊 <b>Conductor Status</b> — {} Active Session{plural}\n{}\n\n",
        sessions.len(),
        "─".repeat(35)
    );
    out.push_str(
        &sessions
            .iter()
            .map(session_block)
            .collect::<Vec<_>>()
            .join("\n\n"),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionType;

    fn session() -> Session {
        Session::new(2, "My-App", SessionType::ClaudeCode, "/tmp/my-app", "conductor-2", "🟣", 45)
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_token_bar() {
        assert_eq!(token_bar(9, 45), "20% (9 / 45)");
        assert!(token_bar(40, 45).contains("⚠️"));
        assert_eq!(token_bar(1, 0), "N/A");
        assert_eq!(token_bar(99, 45), "100% (99 / 45) ⚠️");
    }

    #[test]
    fn test_format_event_with_and_without_session() {
        let s = session();
        let body = format_event("❓", Some(&s), "Waiting for input");
        assert!(body.starts_with("❓ 🟣 My-App\n"));
        assert_eq!(format_event("🔄", None, "restarted"), "🔄 restarted");
    }

    #[test]
    fn test_dashboard_empty_and_populated() {
        assert!(format_dashboard(&[]).contains("No active sessions"));

        let mut s = session();
        s.last_summary = Some("tests green".to_string());
        let dashboard = format_dashboard(&[s]);
        assert!(dashboard.contains("1 Active Session"));
        assert!(dashboard.contains("#2 My-App"));
        assert!(dashboard.contains("tests green"));
        assert!(dashboard.contains("🟢 Running"));
    }

    #[test]
    fn test_uptime_bad_timestamp() {
        assert_eq!(uptime("not a date"), "unknown");
    }
}
