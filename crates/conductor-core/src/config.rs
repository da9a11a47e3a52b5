//! Configuration loading
//!
//! Two files, read once at startup:
//! - `~/.conductor/.env` — secrets as `KEY=VALUE` lines
//! - `~/.conductor/config.yaml` — preferences, parsed with serde_yaml
//!
//! Missing preference sections fall back to defaults; missing required
//! secrets are fatal (the daemon exits with code 64).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// `~/.conductor`
pub fn conductor_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

pub fn db_path() -> PathBuf {
    conductor_home().join("conductor.db")
}

// ============ Preference sections ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_concurrent: usize,
    pub default_type: String,
    pub default_dir: String,
    /// path -> label overrides applied before deriving an alias
    pub aliases: HashMap<String, String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_type: "claude-code".to_string(),
            default_dir: "~/projects".to_string(),
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// One of `pro`, `mid`, `high`
    pub plan_tier: String,
    pub warning_pct: u8,
    pub danger_pct: u8,
    pub critical_pct: u8,
    pub window_hours: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            plan_tier: "pro".to_string(),
            warning_pct: 80,
            danger_pct: 90,
            critical_pct: 95,
            window_hours: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub active_poll_interval_ms: u64,
    pub idle_poll_interval_ms: u64,
    pub output_buffer_max_lines: usize,
    pub completion_idle_threshold_s: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            active_poll_interval_ms: 300,
            idle_poll_interval_ms: 2000,
            output_buffer_max_lines: 5000,
            completion_idle_threshold_s: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub enabled: bool,
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`
    pub end: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundsConfig {
    pub input_required: bool,
    pub token_warning: bool,
    pub error: bool,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub batch_window_s: u64,
    pub confirmation_timeout_s: u64,
    pub quiet_hours: QuietHoursConfig,
    pub sounds: SoundsConfig,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            batch_window_s: 5,
            confirmation_timeout_s: 30,
            quiet_hours: QuietHoursConfig::default(),
            sounds: SoundsConfig {
                input_required: true,
                token_warning: true,
                error: true,
                completed: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultRule {
    pub pattern: String,
    pub response: String,
    #[serde(default = "default_match_type")]
    pub match_type: String,
}

fn default_match_type() -> String {
    "contains".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoResponderConfig {
    pub enabled: bool,
    pub default_rules: Vec<DefaultRule>,
}

impl Default for AutoResponderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rules: vec![
                DefaultRule {
                    pattern: "Continue? (Y/n)".to_string(),
                    response: "y".to_string(),
                    match_type: "contains".to_string(),
                },
                DefaultRule {
                    pattern: "Press Enter to continue".to_string(),
                    response: "".to_string(),
                    match_type: "contains".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub model: String,
    pub summary_max_tokens: u32,
    pub suggestion_max_tokens: u32,
    pub nlp_max_tokens: u32,
    pub timeout_seconds: u64,
    pub fallback_lines: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "claude-haiku-4-5".to_string(),
            summary_max_tokens: 200,
            suggestion_max_tokens: 300,
            nlp_max_tokens: 150,
            timeout_seconds: 10,
            fallback_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub redact_patterns: Vec<String>,
    pub confirm_destructive: bool,
    pub log_all_commands: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            redact_patterns: Vec::new(),
            confirm_destructive: true,
            log_all_commands: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: String,
    pub max_size_mb: u64,
    pub backup_count: u32,
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: "~/.conductor/logs/conductor.log".to_string(),
            max_size_mb: 50,
            backup_count: 3,
            console_output: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub sessions: SessionsConfig,
    pub tokens: TokensConfig,
    pub monitor: MonitorConfig,
    pub notifications: NotificationsConfig,
    pub auto_responder: AutoResponderConfig,
    pub ai: AiConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

// ============ Config ============

/// Secrets + preferences, constructed once at startup and shared by Arc.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub telegram_user_id: i64,
    pub anthropic_api_key: String,
    pub log_level: String,
    pub prefs: Preferences,
}

impl Config {
    /// Load from the default locations under `~/.conductor`.
    pub fn load() -> Self {
        let home = conductor_home();
        Self::load_from(&home.join(".env"), &home.join("config.yaml"))
    }

    pub fn load_from(env_path: &Path, yaml_path: &Path) -> Self {
        let secrets = parse_env_file(env_path);
        let prefs = load_preferences(yaml_path);

        let get = |key: &str| -> String {
            std::env::var(key)
                .ok()
                .or_else(|| secrets.get(key).cloned())
                .unwrap_or_default()
        };

        Self {
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_user_id: get("TELEGRAM_USER_ID").parse().unwrap_or(0),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            log_level: {
                let level = get("LOG_LEVEL");
                if level.is_empty() {
                    "info".to_string()
                } else {
                    level
                }
            },
            prefs,
        }
    }

    /// Return the names of required secrets that are missing.
    pub fn validate(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.telegram_bot_token.is_empty() {
            missing.push("TELEGRAM_BOT_TOKEN");
        }
        if self.telegram_user_id == 0 {
            missing.push("TELEGRAM_USER_ID");
        }
        if self.anthropic_api_key.is_empty() {
            missing.push("ANTHROPIC_API_KEY");
        }
        missing
    }
}

fn load_preferences(path: &Path) -> Preferences {
    if !path.exists() {
        info!(path = %path.display(), "No preferences file, using defaults");
        return Preferences::default();
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str(&content) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(error = %e, "Failed to parse config.yaml, using defaults");
                Preferences::default()
            }
        },
        Err(e) => {
            warn!(error = %e, "Failed to read config.yaml, using defaults");
            Preferences::default()
        }
    }
}

/// Parse a `KEY=VALUE` secrets file. Lines starting with `#` and blank
/// lines are skipped; values may be wrapped in single or double quotes.
fn parse_env_file(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return map;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        map.insert(key.trim().to_string(), value.to_string());
    }
    map
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_env_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "# secrets").unwrap();
        writeln!(f, "TELEGRAM_BOT_TOKEN=123:abc").unwrap();
        writeln!(f, "TELEGRAM_USER_ID = 42").unwrap();
        writeln!(f, "ANTHROPIC_API_KEY=\"sk-ant-test\"").unwrap();
        writeln!(f, "garbage line").unwrap();

        let map = parse_env_file(&path);
        assert_eq!(map.get("TELEGRAM_BOT_TOKEN").unwrap(), "123:abc");
        assert_eq!(map.get("TELEGRAM_USER_ID").unwrap(), "42");
        assert_eq!(map.get("ANTHROPIC_API_KEY").unwrap(), "sk-ant-test");
        assert!(!map.contains_key("garbage line"));
    }

    #[test]
    fn test_validate_reports_missing() {
        let dir = tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("nope.env"), &dir.path().join("nope.yaml"));
        let missing = cfg.validate();
        assert!(missing.contains(&"TELEGRAM_BOT_TOKEN"));
        assert!(missing.contains(&"TELEGRAM_USER_ID"));
        assert!(missing.contains(&"ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_preferences_defaults() {
        let prefs = Preferences::default();
        assert_eq!(prefs.sessions.max_concurrent, 5);
        assert_eq!(prefs.monitor.poll_interval_ms, 500);
        assert_eq!(prefs.notifications.batch_window_s, 5);
        assert_eq!(prefs.tokens.plan_tier, "pro");
        assert_eq!(prefs.ai.timeout_seconds, 10);
    }

    #[test]
    fn test_preferences_partial_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "tokens:\n  plan_tier: high\nmonitor:\n  poll_interval_ms: 250\n",
        )
        .unwrap();
        let prefs = load_preferences(&path);
        assert_eq!(prefs.tokens.plan_tier, "high");
        assert_eq!(prefs.monitor.poll_interval_ms, 250);
        // untouched sections keep defaults
        assert_eq!(prefs.monitor.idle_poll_interval_ms, 2000);
        assert_eq!(prefs.sessions.max_concurrent, 5);
    }
}
