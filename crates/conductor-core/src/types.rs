//! Core types for conductor
//!
//! Record structs and enums for everything the store persists: sessions,
//! commands, auto-response rules and notification events.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Visual identifiers assigned to sessions, reused on teardown.
pub const COLOR_PALETTE: [&str; 6] = ["🔵", "🟣", "🟠", "🟢", "🔴", "🟤"];

// ============ Session ============

/// Session type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    /// Assistant CLI (`claude`) running inside the pane
    ClaudeCode,
    /// Plain interactive shell
    Shell,
    /// One-shot command, pane exits when it finishes
    OneOff,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::ClaudeCode => "claude-code",
            SessionType::Shell => "shell",
            SessionType::OneOff => "one-off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude-code" | "cc" => Some(SessionType::ClaudeCode),
            "shell" | "sh" => Some(SessionType::Shell),
            "one-off" => Some(SessionType::OneOff),
            _ => None,
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Waiting,
    Error,
    Exited,
    RateLimited,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Error => "error",
            SessionStatus::Exited => "exited",
            SessionStatus::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "paused" => Some(SessionStatus::Paused),
            "waiting" => Some(SessionStatus::Waiting),
            "error" => Some(SessionStatus::Error),
            "exited" => Some(SessionStatus::Exited),
            "rate_limited" => Some(SessionStatus::RateLimited),
            _ => None,
        }
    }

    /// Check whether transitioning from `self` to `target` is allowed.
    ///
    /// A paused session never goes straight to exited: an intermediate
    /// observation (error or resume) must happen first. All other
    /// transitions between distinct states are permitted; exited is
    /// terminal.
    pub fn can_transition_to(self, target: SessionStatus) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            (SessionStatus::Exited, _) => false,
            (SessionStatus::Paused, SessionStatus::Exited) => false,
            _ => true,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SessionStatus::Exited)
    }
}

/// A monitored tmux session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUID primary key
    pub id: String,
    /// Small sequential number for user-facing references (`#3`)
    pub number: i64,
    /// Human alias, unique among active sessions
    pub alias: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub working_dir: String,
    /// tmux session name (`conductor-3`)
    pub tmux_session: String,
    pub tmux_pane_id: Option<String>,
    pub pid: Option<i64>,
    pub status: SessionStatus,
    /// Token from [`COLOR_PALETTE`]
    pub color_token: String,
    /// Estimated messages used in the current window
    pub token_used: i64,
    /// Message limit for the configured plan tier
    pub token_limit: i64,
    pub last_activity: Option<String>,
    pub last_summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn new(
        number: i64,
        alias: &str,
        session_type: SessionType,
        working_dir: &str,
        tmux_session: &str,
        color_token: &str,
        token_limit: i64,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            alias: alias.to_string(),
            session_type,
            working_dir: working_dir.to_string(),
            tmux_session: tmux_session.to_string(),
            tmux_pane_id: None,
            pid: None,
            status: SessionStatus::Running,
            color_token: color_token.to_string(),
            token_used: 0,
            token_limit,
            last_activity: None,
            last_summary: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Label shown in chat messages: color token + alias.
    pub fn label(&self) -> String {
        format!("{} {}", self.color_token, self.alias)
    }
}

/// Convert a working directory into a readable alias.
///
/// `~/projects/my-cool_app` becomes `My-Cool-App`.
pub fn alias_from_dir(working_dir: &str) -> String {
    let folder = working_dir
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(working_dir);
    folder
        .split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

// ============ Command ============

/// Who originated a command sent to a pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    User,
    Auto,
    System,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandSource::User => "user",
            CommandSource::Auto => "auto",
            CommandSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(CommandSource::User),
            "auto" => Some(CommandSource::Auto),
            "system" => Some(CommandSource::System),
            _ => None,
        }
    }
}

/// Audit record for input delivered to a pane. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Option<i64>,
    pub session_id: String,
    pub source: CommandSource,
    /// Exact bytes sent to the pane
    pub input: String,
    /// Triggering prompt text or rule id
    pub context: Option<String>,
    pub timestamp: String,
}

impl Command {
    pub fn new(session_id: &str, source: CommandSource, input: &str, context: Option<String>) -> Self {
        Self {
            id: None,
            session_id: session_id.to_string(),
            source,
            input: input.to_string(),
            context,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// ============ AutoRule ============

/// Matching strategy for an auto-response rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Regex,
    Contains,
    Exact,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Regex => "regex",
            MatchType::Contains => "contains",
            MatchType::Exact => "exact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regex" => Some(MatchType::Regex),
            "contains" => Some(MatchType::Contains),
            "exact" => Some(MatchType::Exact),
            _ => None,
        }
    }
}

/// An auto-response rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRule {
    pub id: i64,
    pub pattern: String,
    pub response: String,
    pub match_type: MatchType,
    pub enabled: bool,
    pub hit_count: i64,
    pub created_at: String,
}

// ============ Event ============

/// Notification event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InputRequired,
    TokenWarning,
    Error,
    Completed,
    RateLimit,
    AutoResponse,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InputRequired => "input_required",
            EventType::TokenWarning => "token_warning",
            EventType::Error => "error",
            EventType::Completed => "completed",
            EventType::RateLimit => "rate_limit",
            EventType::AutoResponse => "auto_response",
            EventType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input_required" => Some(EventType::InputRequired),
            "token_warning" => Some(EventType::TokenWarning),
            "error" => Some(EventType::Error),
            "completed" => Some(EventType::Completed),
            "rate_limit" => Some(EventType::RateLimit),
            "auto_response" => Some(EventType::AutoResponse),
            "system" => Some(EventType::System),
            _ => None,
        }
    }
}

/// A notification record, persisted for history and acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub session_id: Option<String>,
    pub event_type: EventType,
    pub message: String,
    pub acknowledged: bool,
    /// Message id on the chat platform, for later edit/delete
    pub platform_message_id: Option<i64>,
    pub timestamp: String,
}

impl Event {
    pub fn new(session_id: Option<&str>, event_type: EventType, message: &str) -> Self {
        Self {
            id: None,
            session_id: session_id.map(str::to_string),
            event_type,
            message: message.to_string(),
            acknowledged: false,
            platform_message_id: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_platform_message_id(mut self, id: Option<i64>) -> Self {
        self.platform_message_id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_from_dir() {
        assert_eq!(alias_from_dir("/home/me/projects/my-app"), "My-App");
        assert_eq!(alias_from_dir("/srv/data_loader/"), "Data-Loader");
        assert_eq!(alias_from_dir("plain"), "Plain");
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Waiting,
            SessionStatus::Error,
            SessionStatus::Exited,
            SessionStatus::RateLimited,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_paused_never_exits_directly() {
        assert!(!SessionStatus::Paused.can_transition_to(SessionStatus::Exited));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Error));
        assert!(SessionStatus::Error.can_transition_to(SessionStatus::Exited));
        assert!(!SessionStatus::Exited.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn test_session_type_shorthand() {
        assert_eq!(SessionType::parse("cc"), Some(SessionType::ClaudeCode));
        assert_eq!(SessionType::parse("sh"), Some(SessionType::Shell));
        assert_eq!(SessionType::parse("bogus"), None);
    }
}
