//! SQLite store for conductor
//!
//! Owns every persisted row: sessions, commands, auto-response rules and
//! events. WAL journaling keeps readers unblocked during writes; a busy
//! timeout plus a short jittered retry absorbs transient lock contention.
//! All access goes through one connection behind a mutex, so writes are
//! serialized without a dedicated writer task.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::types::{
    AutoRule, Command, CommandSource, Event, EventType, MatchType, Session, SessionStatus,
    SessionType,
};

/// Lock wait before rusqlite reports SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u64 = 5000;
/// Rows older than this are pruned at boot.
const PRUNE_MAX_AGE_DAYS: i64 = 30;
const BUSY_RETRIES: u32 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    number INTEGER NOT NULL,
    alias TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('claude-code', 'shell', 'one-off')),
    working_dir TEXT NOT NULL,
    tmux_session TEXT NOT NULL,
    tmux_pane_id TEXT,
    pid INTEGER,
    status TEXT NOT NULL DEFAULT 'running'
        CHECK(status IN ('running', 'paused', 'waiting', 'error', 'exited', 'rate_limited')),
    color_token TEXT NOT NULL DEFAULT '🔵',
    token_used INTEGER DEFAULT 0,
    token_limit INTEGER DEFAULT 45,
    last_activity TEXT,
    last_summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
    source TEXT NOT NULL CHECK(source IN ('user', 'auto', 'system')),
    input TEXT NOT NULL,
    context TEXT,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auto_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern TEXT NOT NULL,
    response TEXT NOT NULL,
    match_type TEXT NOT NULL DEFAULT 'contains'
        CHECK(match_type IN ('regex', 'contains', 'exact')),
    enabled INTEGER NOT NULL DEFAULT 1,
    hit_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL
        CHECK(event_type IN ('input_required', 'token_warning', 'error', 'completed',
                             'rate_limit', 'auto_response', 'system')),
    message TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    platform_message_id INTEGER,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_commands_session ON commands(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, acknowledged);
"#;

/// Partial update for a session row. Unset fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub alias: Option<String>,
    pub status: Option<SessionStatus>,
    pub pid: Option<Option<i64>>,
    pub token_used: Option<i64>,
    pub last_activity: Option<String>,
    pub last_summary: Option<String>,
}

/// SQLite-backed store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `op` against the connection, retrying a few times with jitter
    /// when the database reports busy.
    fn with_retry<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let conn = self.conn.lock().unwrap();
                op(&conn)
            };
            match result {
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < BUSY_RETRIES =>
                {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..100);
                    std::thread::sleep(Duration::from_millis(100 + jitter));
                }
                other => return other,
            }
        }
    }

    // ============ Sessions ============

    pub fn create_session(&self, session: &Session) -> rusqlite::Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, number, alias, type, working_dir, tmux_session,
                 tmux_pane_id, pid, status, color_token, token_used, token_limit,
                 last_activity, last_summary, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    session.id,
                    session.number,
                    session.alias,
                    session.session_type.as_str(),
                    session.working_dir,
                    session.tmux_session,
                    session.tmux_pane_id,
                    session.pid,
                    session.status.as_str(),
                    session.color_token,
                    session.token_used,
                    session.token_limit,
                    session.last_activity,
                    session.last_summary,
                    session.created_at,
                    session.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> rusqlite::Result<Option<Session>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM sessions WHERE id = ?")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(Self::row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn get_all_sessions(&self, active_only: bool) -> rusqlite::Result<Vec<Session>> {
        self.with_retry(|conn| {
            let sql = if active_only {
                "SELECT * FROM sessions WHERE status != 'exited' ORDER BY number"
            } else {
                "SELECT * FROM sessions ORDER BY number"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], Self::row_to_session)?;
            rows.collect()
        })
    }

    pub fn update_session(&self, id: &str, update: &SessionUpdate) -> rusqlite::Result<()> {
        self.with_retry(|conn| {
            let mut fields: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(alias) = &update.alias {
                fields.push("alias = ?");
                values.push(Box::new(alias.clone()));
            }
            if let Some(status) = &update.status {
                fields.push("status = ?");
                values.push(Box::new(status.as_str().to_string()));
            }
            if let Some(pid) = &update.pid {
                fields.push("pid = ?");
                values.push(Box::new(*pid));
            }
            if let Some(token_used) = &update.token_used {
                fields.push("token_used = ?");
                values.push(Box::new(*token_used));
            }
            if let Some(last_activity) = &update.last_activity {
                fields.push("last_activity = ?");
                values.push(Box::new(last_activity.clone()));
            }
            if let Some(last_summary) = &update.last_summary {
                fields.push("last_summary = ?");
                values.push(Box::new(last_summary.clone()));
            }

            if fields.is_empty() {
                return Ok(());
            }
            fields.push("updated_at = ?");
            values.push(Box::new(Utc::now().to_rfc3339()));

            let sql = format!("UPDATE sessions SET {} WHERE id = ?", fields.join(", "));
            values.push(Box::new(id.to_string()));
            let args: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            conn.execute(&sql, args.as_slice())?;
            Ok(())
        })
    }

    /// Next session number: smallest positive integer not used by an
    /// active session, so numbers are reused after teardown.
    pub fn next_session_number(&self) -> rusqlite::Result<i64> {
        self.with_retry(|conn| {
            let mut stmt =
                conn.prepare("SELECT number FROM sessions WHERE status != 'exited' ORDER BY number")?;
            let used: Vec<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            let mut candidate = 1;
            for number in used {
                if number == candidate {
                    candidate += 1;
                } else if number > candidate {
                    break;
                }
            }
            Ok(candidate)
        })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let type_str: String = row.get("type")?;
        let status_str: String = row.get("status")?;
        Ok(Session {
            id: row.get("id")?,
            number: row.get("number")?,
            alias: row.get("alias")?,
            session_type: SessionType::parse(&type_str).unwrap_or(SessionType::Shell),
            working_dir: row.get("working_dir")?,
            tmux_session: row.get("tmux_session")?,
            tmux_pane_id: row.get("tmux_pane_id")?,
            pid: row.get("pid")?,
            status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Error),
            color_token: row.get("color_token")?,
            token_used: row.get("token_used")?,
            token_limit: row.get("token_limit")?,
            last_activity: row.get("last_activity")?,
            last_summary: row.get("last_summary")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    // ============ Commands ============

    pub fn log_command(&self, command: &Command) -> rusqlite::Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO commands (session_id, source, input, context, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    command.session_id,
                    command.source.as_str(),
                    command.input,
                    command.context,
                    command.timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_commands(&self, session_id: &str, limit: i64) -> rusqlite::Result<Vec<Command>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM commands WHERE session_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![session_id, limit], Self::row_to_command)?;
            rows.collect()
        })
    }

    fn row_to_command(row: &rusqlite::Row) -> rusqlite::Result<Command> {
        let source_str: String = row.get("source")?;
        Ok(Command {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            source: CommandSource::parse(&source_str).unwrap_or(CommandSource::System),
            input: row.get("input")?,
            context: row.get("context")?,
            timestamp: row.get("timestamp")?,
        })
    }

    // ============ Auto rules ============

    /// Insert a rule. Regex patterns must compile; a broken pattern is
    /// rejected here rather than at match time.
    pub fn add_rule(
        &self,
        pattern: &str,
        response: &str,
        match_type: MatchType,
    ) -> rusqlite::Result<i64> {
        if match_type == MatchType::Regex {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(rusqlite::Error::ToSqlConversionFailure(Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("invalid regex pattern: {e}"),
                    ),
                )));
            }
        }
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO auto_rules (pattern, response, match_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![pattern, response, match_type.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_rules(&self, enabled_only: bool) -> rusqlite::Result<Vec<AutoRule>> {
        self.with_retry(|conn| {
            let sql = if enabled_only {
                "SELECT * FROM auto_rules WHERE enabled = 1 ORDER BY id"
            } else {
                "SELECT * FROM auto_rules ORDER BY id"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], Self::row_to_rule)?;
            rows.collect()
        })
    }

    pub fn delete_rule(&self, rule_id: i64) -> rusqlite::Result<bool> {
        self.with_retry(|conn| {
            let affected = conn.execute("DELETE FROM auto_rules WHERE id = ?", params![rule_id])?;
            Ok(affected > 0)
        })
    }

    pub fn increment_rule_hit(&self, rule_id: i64) -> rusqlite::Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE auto_rules SET hit_count = hit_count + 1 WHERE id = ?",
                params![rule_id],
            )?;
            Ok(())
        })
    }

    pub fn set_rules_enabled(&self, enabled: bool) -> rusqlite::Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE auto_rules SET enabled = ?",
                params![if enabled { 1 } else { 0 }],
            )?;
            Ok(())
        })
    }

    /// Insert configured default rules, only when the table is empty.
    pub fn seed_default_rules(
        &self,
        rules: &[(String, String, MatchType)],
    ) -> rusqlite::Result<usize> {
        let existing: i64 = self.with_retry(|conn| {
            conn.query_row("SELECT COUNT(*) FROM auto_rules", [], |row| row.get(0))
        })?;
        if existing > 0 {
            return Ok(0);
        }
        let mut seeded = 0;
        for (pattern, response, match_type) in rules {
            if self.add_rule(pattern, response, *match_type).is_ok() {
                seeded += 1;
            }
        }
        info!(count = seeded, "Seeded default auto-response rules");
        Ok(seeded)
    }

    fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<AutoRule> {
        let match_type_str: String = row.get("match_type")?;
        let enabled: i64 = row.get("enabled")?;
        Ok(AutoRule {
            id: row.get("id")?,
            pattern: row.get("pattern")?,
            response: row.get("response")?,
            match_type: MatchType::parse(&match_type_str).unwrap_or(MatchType::Contains),
            enabled: enabled == 1,
            hit_count: row.get("hit_count")?,
            created_at: row.get("created_at")?,
        })
    }

    // ============ Events ============

    pub fn log_event(&self, event: &Event) -> rusqlite::Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO events (session_id, event_type, message, acknowledged,
                 platform_message_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.session_id,
                    event.event_type.as_str(),
                    event.message,
                    event.acknowledged as i64,
                    event.platform_message_id,
                    event.timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_events(
        &self,
        session_id: Option<&str>,
        limit: i64,
    ) -> rusqlite::Result<Vec<Event>> {
        self.with_retry(|conn| match session_id {
            Some(sid) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events WHERE session_id = ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![sid, limit], Self::row_to_event)?;
                rows.collect()
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM events ORDER BY timestamp DESC, id DESC LIMIT ?")?;
                let rows = stmt.query_map(params![limit], Self::row_to_event)?;
                rows.collect()
            }
        })
    }

    pub fn acknowledge_event(&self, event_id: i64) -> rusqlite::Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE events SET acknowledged = 1 WHERE id = ?",
                params![event_id],
            )?;
            Ok(())
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
        let type_str: String = row.get("event_type")?;
        let acknowledged: i64 = row.get("acknowledged")?;
        Ok(Event {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            event_type: EventType::parse(&type_str).unwrap_or(EventType::System),
            message: row.get("message")?,
            acknowledged: acknowledged == 1,
            platform_message_id: row.get("platform_message_id")?,
            timestamp: row.get("timestamp")?,
        })
    }

    // ============ Maintenance ============

    /// Delete commands and events older than 30 days. Run once at boot.
    pub fn prune_old_records(&self) -> rusqlite::Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::days(PRUNE_MAX_AGE_DAYS)).to_rfc3339();
        self.with_retry(|conn| {
            let commands = conn.execute("DELETE FROM commands WHERE timestamp < ?", params![cutoff])?;
            let events = conn.execute("DELETE FROM events WHERE timestamp < ?", params![cutoff])?;
            debug!(commands, events, "Pruned old records");
            Ok(commands + events)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::alias_from_dir;

    fn test_session(number: i64, alias: &str) -> Session {
        Session::new(
            number,
            alias,
            SessionType::ClaudeCode,
            "/tmp/proj",
            &format!("conductor-{number}"),
            "🔵",
            45,
        )
    }

    #[test]
    fn test_session_roundtrip() {
        let store = Store::in_memory().unwrap();
        let session = test_session(1, &alias_from_dir("/tmp/proj"));
        store.create_session(&session).unwrap();

        let loaded = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.alias, "Proj");
        assert_eq!(loaded.session_type, SessionType::ClaudeCode);
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.token_limit, 45);
    }

    #[test]
    fn test_update_session_partial() {
        let store = Store::in_memory().unwrap();
        let session = test_session(1, "App");
        store.create_session(&session).unwrap();

        store
            .update_session(
                &session.id,
                &SessionUpdate {
                    status: Some(SessionStatus::Paused),
                    last_summary: Some("built ok".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Paused);
        assert_eq!(loaded.last_summary.as_deref(), Some("built ok"));
        // untouched
        assert_eq!(loaded.alias, "App");
    }

    #[test]
    fn test_session_numbers_reused_after_exit() {
        let store = Store::in_memory().unwrap();
        for n in 1..=3 {
            store.create_session(&test_session(n, &format!("s{n}"))).unwrap();
        }
        assert_eq!(store.next_session_number().unwrap(), 4);

        // Exit #2; its number becomes available again.
        let sessions = store.get_all_sessions(false).unwrap();
        let second = sessions.iter().find(|s| s.number == 2).unwrap();
        store
            .update_session(
                &second.id,
                &SessionUpdate {
                    status: Some(SessionStatus::Exited),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.next_session_number().unwrap(), 2);
    }

    #[test]
    fn test_active_only_listing() {
        let store = Store::in_memory().unwrap();
        store.create_session(&test_session(1, "a")).unwrap();
        let mut dead = test_session(2, "b");
        dead.status = SessionStatus::Exited;
        store.create_session(&dead).unwrap();

        assert_eq!(store.get_all_sessions(true).unwrap().len(), 1);
        assert_eq!(store.get_all_sessions(false).unwrap().len(), 2);
    }

    #[test]
    fn test_commands_append_only() {
        let store = Store::in_memory().unwrap();
        let session = test_session(1, "a");
        store.create_session(&session).unwrap();

        store
            .log_command(&Command::new(&session.id, CommandSource::Auto, "y", Some("rule 1".into())))
            .unwrap();
        store
            .log_command(&Command::new(&session.id, CommandSource::User, "ls", None))
            .unwrap();

        let commands = store.get_commands(&session.id, 10).unwrap();
        assert_eq!(commands.len(), 2);
        // newest first
        assert_eq!(commands[0].input, "ls");
        assert_eq!(commands[1].source, CommandSource::Auto);
        assert_eq!(commands[1].context.as_deref(), Some("rule 1"));
    }

    #[test]
    fn test_rules_crud_and_hits() {
        let store = Store::in_memory().unwrap();
        let id = store.add_rule("Continue? (Y/n)", "y", MatchType::Contains).unwrap();
        store.increment_rule_hit(id).unwrap();
        store.increment_rule_hit(id).unwrap();

        let rules = store.get_rules(false).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hit_count, 2);
        assert!(rules[0].enabled);

        store.set_rules_enabled(false).unwrap();
        assert!(store.get_rules(true).unwrap().is_empty());

        assert!(store.delete_rule(id).unwrap());
        assert!(!store.delete_rule(id).unwrap());
    }

    #[test]
    fn test_invalid_regex_rejected_at_insert() {
        let store = Store::in_memory().unwrap();
        assert!(store.add_rule("([unclosed", "y", MatchType::Regex).is_err());
        // contains rules are never compiled
        assert!(store.add_rule("([unclosed", "y", MatchType::Contains).is_ok());
    }

    #[test]
    fn test_seed_default_rules_only_once() {
        let store = Store::in_memory().unwrap();
        let defaults = vec![("Continue?".to_string(), "y".to_string(), MatchType::Contains)];
        assert_eq!(store.seed_default_rules(&defaults).unwrap(), 1);
        assert_eq!(store.seed_default_rules(&defaults).unwrap(), 0);
        assert_eq!(store.get_rules(false).unwrap().len(), 1);
    }

    #[test]
    fn test_events_and_acknowledge() {
        let store = Store::in_memory().unwrap();
        let session = test_session(1, "a");
        store.create_session(&session).unwrap();

        let id = store
            .log_event(
                &Event::new(Some(&session.id), EventType::AutoResponse, "Auto: y")
                    .with_platform_message_id(Some(99)),
            )
            .unwrap();

        let events = store.get_events(Some(&session.id), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].acknowledged);
        assert_eq!(events[0].platform_message_id, Some(99));

        store.acknowledge_event(id).unwrap();
        let events = store.get_events(None, 10).unwrap();
        assert!(events[0].acknowledged);
    }

    #[test]
    fn test_prune_old_records() {
        let store = Store::in_memory().unwrap();
        let session = test_session(1, "a");
        store.create_session(&session).unwrap();

        let mut old_cmd = Command::new(&session.id, CommandSource::User, "ls", None);
        old_cmd.timestamp = (Utc::now() - ChronoDuration::days(45)).to_rfc3339();
        store.log_command(&old_cmd).unwrap();
        store
            .log_command(&Command::new(&session.id, CommandSource::User, "pwd", None))
            .unwrap();

        let mut old_event = Event::new(Some(&session.id), EventType::System, "old");
        old_event.timestamp = (Utc::now() - ChronoDuration::days(31)).to_rfc3339();
        store.log_event(&old_event).unwrap();

        let pruned = store.prune_old_records().unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(store.get_commands(&session.id, 10).unwrap().len(), 1);
        assert!(store.get_events(None, 10).unwrap().is_empty());
    }
}
