//! Session manager
//!
//! Sole owner of Session records. Creates and kills tmux sessions,
//! pauses and resumes their processes, derives aliases and colors, and
//! runs the health sweep that downgrades dead sessions. Every mutation
//! is persisted before it is visible to callers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{MonitorConfig, SessionsConfig};
use crate::db::{SessionUpdate, Store};
use crate::pane::{MonitorControl, MonitorEvent, PaneAdapter, PaneMonitor, TmuxClient, TmuxPane};
use crate::types::{
    alias_from_dir, Session, SessionStatus, SessionType, COLOR_PALETTE,
};

/// Longest accepted alias, in characters.
const MAX_ALIAS_LEN: usize = 50;

struct Inner {
    sessions: HashMap<String, Session>,
    panes: HashMap<String, Arc<dyn PaneAdapter>>,
    monitors: HashMap<String, MonitorControl>,
}

/// Creates, tracks and tears down monitored sessions.
pub struct SessionManager {
    store: Arc<Store>,
    tmux: TmuxClient,
    config: SessionsConfig,
    monitor_config: MonitorConfig,
    token_limit: i64,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        tmux: TmuxClient,
        config: SessionsConfig,
        monitor_config: MonitorConfig,
        token_limit: i64,
    ) -> Self {
        Self {
            store,
            tmux,
            config,
            monitor_config,
            token_limit,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                panes: HashMap::new(),
                monitors: HashMap::new(),
            }),
        }
    }

    /// Re-populate the in-memory map from the store at startup. Panes
    /// are rebuilt from the stored pane ids; whether they still exist is
    /// settled by the first capture or health sweep.
    pub fn load_from_store(&self) -> Result<usize> {
        let sessions = self.store.get_all_sessions(true)?;
        let mut inner = self.inner.lock().unwrap();
        let count = sessions.len();
        for session in sessions {
            if let Some(pane_id) = &session.tmux_pane_id {
                let pane: Arc<dyn PaneAdapter> =
                    Arc::new(TmuxPane::new(self.tmux.clone(), pane_id));
                inner.panes.insert(session.id.clone(), pane);
            }
            inner.sessions.insert(session.id.clone(), session);
        }
        Ok(count)
    }

    // ============ Queries ============

    pub fn list(&self) -> Vec<Session> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.number);
        sessions
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn get_by_number(&self, number: i64) -> Option<Session> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.values().find(|s| s.number == number).cloned()
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<Session> {
        let lower = alias.to_lowercase();
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .values()
            .find(|s| s.alias.to_lowercase() == lower)
            .cloned()
    }

    /// Resolve `#N`, a number, an alias (case-insensitive, substring as a
    /// last resort) or a raw id.
    pub fn resolve(&self, identifier: &str) -> Option<Session> {
        let trimmed = identifier.trim().trim_start_matches('#');
        if let Ok(number) = trimmed.parse::<i64>() {
            if let Some(session) = self.get_by_number(number) {
                return Some(session);
            }
        }
        if let Some(session) = self.get_by_alias(trimmed) {
            return Some(session);
        }
        if let Some(session) = self.get(trimmed) {
            return Some(session);
        }
        // Alias substring, only when unambiguous and not trivially short.
        let lower = trimmed.to_lowercase();
        if lower.chars().count() < 2 {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        let matches: Vec<&Session> = inner
            .sessions
            .values()
            .filter(|s| s.alias.to_lowercase().contains(&lower))
            .collect();
        if matches.len() == 1 {
            return Some(matches[0].clone());
        }
        None
    }

    pub fn get_pane(&self, id: &str) -> Option<Arc<dyn PaneAdapter>> {
        self.inner.lock().unwrap().panes.get(id).cloned()
    }

    pub fn monitor_control(&self, id: &str) -> Option<MonitorControl> {
        self.inner.lock().unwrap().monitors.get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Compact JSON list fed to the NL parser prompt.
    pub fn session_list_json(&self) -> String {
        let entries: Vec<serde_json::Value> = self
            .list()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "number": s.number,
                    "alias": s.alias,
                    "type": s.session_type.as_str(),
                    "status": s.status.as_str(),
                })
            })
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    // ============ Lifecycle ============

    /// Create a tmux session, persist its record and start tracking it.
    pub async fn create_session(
        &self,
        session_type: SessionType,
        working_dir: Option<&str>,
        alias: Option<&str>,
    ) -> Result<Session> {
        if self.active_count() >= self.config.max_concurrent {
            bail!("max {} concurrent sessions reached", self.config.max_concurrent);
        }

        let working_dir = crate::config::expand_tilde(
            working_dir.unwrap_or(self.config.default_dir.as_str()),
        );
        if !Path::new(&working_dir).is_dir() {
            bail!("directory does not exist: {}", working_dir.display());
        }
        let working_dir = working_dir.to_string_lossy().to_string();

        let alias = match alias {
            Some(alias) => validate_alias(alias)?,
            None => self.derive_alias(&working_dir),
        };
        let alias = self.uniquify_alias(&alias);

        let number = self.store.next_session_number()?;
        let tmux_name = format!("conductor-{number}");
        let color = self.next_color();

        let (pane_id, pid) = self
            .tmux
            .create_session(&tmux_name, &working_dir)
            .await
            .context("tmux session creation failed")?;

        let pane: Arc<dyn PaneAdapter> = Arc::new(TmuxPane::new(self.tmux.clone(), &pane_id));
        if session_type == SessionType::ClaudeCode {
            pane.send("claude", true)
                .await
                .map_err(|e| anyhow!("failed to start assistant CLI: {e}"))?;
        }

        let mut session = Session::new(
            number,
            &alias,
            session_type,
            &working_dir,
            &tmux_name,
            &color,
            self.token_limit,
        );
        session.tmux_pane_id = Some(pane_id);
        session.pid = pid;

        self.store.create_session(&session)?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.insert(session.id.clone(), session.clone());
            inner.panes.insert(session.id.clone(), pane);
        }

        info!(
            number,
            alias = %session.alias,
            dir = %session.working_dir,
            "Created session"
        );
        Ok(session)
    }

    /// Spawn the monitor loop for a session. Events land on `events_tx`.
    pub fn start_monitor(&self, session: &Session, events_tx: mpsc::Sender<MonitorEvent>) {
        let Some(pane) = self.get_pane(&session.id) else {
            warn!(session = %session.alias, "No pane to monitor");
            return;
        };
        let (monitor, control) = PaneMonitor::new(
            &session.id,
            &session.alias,
            pane,
            events_tx,
            self.monitor_config.clone(),
        );
        if session.status == SessionStatus::Paused {
            control.pause();
        }
        self.inner
            .lock()
            .unwrap()
            .monitors
            .insert(session.id.clone(), control);
        tokio::spawn(monitor.run());
    }

    /// Kill the tmux session and mark the record exited. A paused
    /// session is first observed as errored, never exited directly.
    pub async fn kill_session(&self, id: &str) -> Result<Session> {
        let session = self.get(id).ok_or_else(|| anyhow!("no such session"))?;

        if let Err(e) = self.tmux.kill_session(&session.tmux_session).await {
            warn!(session = %session.alias, error = %e, "tmux kill failed");
        }
        self.mark_exited(id)?;
        info!(number = session.number, alias = %session.alias, "Killed session");
        self.get(id)
            .or(Some(session))
            .ok_or_else(|| anyhow!("session vanished"))
    }

    /// Stop the process with SIGSTOP and slow its monitor down.
    pub async fn pause_session(&self, id: &str) -> Result<Session> {
        let session = self.get(id).ok_or_else(|| anyhow!("no such session"))?;
        let pid = session.pid.ok_or_else(|| anyhow!("session has no pid"))?;

        if !self.tmux.signal_pid(pid, "STOP").await? {
            // Process already gone: observe, then exit.
            self.set_status(id, SessionStatus::Error)?;
            self.mark_exited(id)?;
            bail!("process {pid} is gone");
        }
        self.set_status(id, SessionStatus::Paused)?;
        if let Some(control) = self.monitor_control(id) {
            control.pause();
        }
        info!(number = session.number, "Paused session");
        self.get(id).ok_or_else(|| anyhow!("session vanished"))
    }

    /// Resume a paused process with SIGCONT.
    pub async fn resume_session(&self, id: &str) -> Result<Session> {
        let session = self.get(id).ok_or_else(|| anyhow!("no such session"))?;
        let pid = session.pid.ok_or_else(|| anyhow!("session has no pid"))?;

        if !self.tmux.signal_pid(pid, "CONT").await? {
            self.set_status(id, SessionStatus::Error)?;
            self.mark_exited(id)?;
            bail!("process {pid} is gone");
        }
        self.set_status(id, SessionStatus::Running)?;
        if let Some(control) = self.monitor_control(id) {
            control.resume();
        }
        info!(number = session.number, "Resumed session");
        self.get(id).ok_or_else(|| anyhow!("session vanished"))
    }

    /// Stop the process and mark the session rate-limited. Used by the
    /// dispatcher when the CLI reports a limit or the estimator crosses
    /// its critical threshold.
    pub async fn rate_limit_session(&self, id: &str) -> Result<Session> {
        let session = self.get(id).ok_or_else(|| anyhow!("no such session"))?;
        if let Some(pid) = session.pid {
            let _ = self.tmux.signal_pid(pid, "STOP").await;
        }
        self.set_status(id, SessionStatus::RateLimited)?;
        if let Some(control) = self.monitor_control(id) {
            control.pause();
        }
        info!(number = session.number, "Session rate-limited, paused");
        self.get(id).ok_or_else(|| anyhow!("session vanished"))
    }

    pub fn rename_session(&self, id: &str, new_alias: &str) -> Result<Session> {
        let alias = validate_alias(new_alias)?;
        let alias = self.uniquify_alias(&alias);
        self.get(id).ok_or_else(|| anyhow!("no such session"))?;
        self.store.update_session(
            id,
            &SessionUpdate {
                alias: Some(alias.clone()),
                ..Default::default()
            },
        )?;
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such session"))?;
        session.alias = alias;
        Ok(session.clone())
    }

    /// Deliver text into the session's pane.
    pub async fn send_input(&self, id: &str, text: &str, press_enter: bool) -> Result<()> {
        let pane = self
            .get_pane(id)
            .ok_or_else(|| anyhow!("no pane for session"))?;
        pane.send(text, press_enter)
            .await
            .map_err(|e| anyhow!("send failed: {e}"))
    }

    // ============ Status transitions ============

    /// Validated status change, persisted before the in-memory update.
    pub fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let current = self
            .get(id)
            .ok_or_else(|| anyhow!("no such session"))?
            .status;
        if !current.can_transition_to(status) {
            bail!(
                "invalid status transition: {} -> {}",
                current.as_str(),
                status.as_str()
            );
        }
        self.store.update_session(
            id,
            &SessionUpdate {
                status: Some(status),
                ..Default::default()
            },
        )?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(id) {
            session.status = status;
        }
        Ok(())
    }

    /// Terminal teardown. Paused sessions are routed through an error
    /// observation first, and all tracking state is dropped.
    pub fn mark_exited(&self, id: &str) -> Result<()> {
        let Some(session) = self.get(id) else {
            return Ok(());
        };
        if session.status == SessionStatus::Paused {
            self.set_status(id, SessionStatus::Error)?;
        }
        self.set_status(id, SessionStatus::Exited)?;

        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(id);
        inner.panes.remove(id);
        if let Some(control) = inner.monitors.remove(id) {
            control.stop();
        }
        Ok(())
    }

    pub fn update_summary(&self, id: &str, summary: &str) -> Result<()> {
        self.store.update_session(
            id,
            &SessionUpdate {
                last_summary: Some(summary.to_string()),
                ..Default::default()
            },
        )?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(id) {
            session.last_summary = Some(summary.to_string());
        }
        Ok(())
    }

    pub fn touch_activity(&self, id: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = self.store.update_session(
            id,
            &SessionUpdate {
                last_activity: Some(now.clone()),
                ..Default::default()
            },
        );
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(id) {
            session.last_activity = Some(now);
        }
    }

    pub fn record_token_use(&self, id: &str, used: i64) {
        let _ = self.store.update_session(
            id,
            &SessionUpdate {
                token_used: Some(used),
                ..Default::default()
            },
        );
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(id) {
            session.token_used = used;
        }
    }

    // ============ Recovery and health ============

    /// Adopt `conductor-*` tmux sessions left over from a previous run.
    /// Returns the recovered sessions.
    pub async fn recover_sessions(&self) -> Result<Vec<Session>> {
        if !self.tmux.is_server_running().await {
            return Ok(Vec::new());
        }
        let known_numbers: Vec<i64> = self.list().iter().map(|s| s.number).collect();
        let mut recovered = Vec::new();

        for name in self.tmux.list_sessions().await? {
            let Some(number) = name
                .strip_prefix("conductor-")
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            if known_numbers.contains(&number) {
                continue;
            }

            let (pane_id, pid) = match self.tmux.pane_info(&name).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(session = %name, error = %e, "Cannot inspect pane, skipping");
                    continue;
                }
            };
            if let Some(pid) = pid {
                if !self.tmux.is_pid_alive(pid).await {
                    info!(session = %name, "Process dead, not recovering");
                    continue;
                }
            }

            let working_dir = self
                .tmux
                .pane_current_path(&name)
                .await
                .unwrap_or_else(|_| "~".to_string());
            let alias = self.uniquify_alias(&self.derive_alias(&working_dir));
            let color = self.next_color();

            let mut session = Session::new(
                number,
                &alias,
                SessionType::ClaudeCode,
                &working_dir,
                &name,
                &color,
                self.token_limit,
            );
            session.tmux_pane_id = Some(pane_id.clone());
            session.pid = pid;

            self.store.create_session(&session)?;
            {
                let pane: Arc<dyn PaneAdapter> =
                    Arc::new(TmuxPane::new(self.tmux.clone(), &pane_id));
                let mut inner = self.inner.lock().unwrap();
                inner.sessions.insert(session.id.clone(), session.clone());
                inner.panes.insert(session.id.clone(), pane);
            }
            info!(number, alias = %session.alias, "Recovered session");
            recovered.push(session);
        }
        Ok(recovered)
    }

    /// Verify every tracked session still has a live process. Dead ones
    /// are exited; returns the sessions that were torn down.
    pub async fn health_sweep(&self) -> Vec<Session> {
        let mut dead = Vec::new();
        for session in self.list() {
            let alive = match session.pid {
                Some(pid) => self.tmux.is_pid_alive(pid).await,
                None => true,
            };
            if !alive {
                warn!(
                    number = session.number,
                    alias = %session.alias,
                    "Session process died"
                );
                if self.mark_exited(&session.id).is_ok() {
                    dead.push(session);
                }
            }
        }
        dead
    }

    // ============ Helpers ============

    fn derive_alias(&self, working_dir: &str) -> String {
        for (path, label) in &self.config.aliases {
            let expanded = crate::config::expand_tilde(path);
            if expanded == Path::new(working_dir) {
                return label.clone();
            }
        }
        alias_from_dir(working_dir)
    }

    fn uniquify_alias(&self, alias: &str) -> String {
        if self.get_by_alias(alias).is_none() {
            return alias.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{alias}-{n}");
            if self.get_by_alias(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    /// First unused palette token; wraps to the front when all six are
    /// taken.
    fn next_color(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let used: Vec<&str> = inner
            .sessions
            .values()
            .map(|s| s.color_token.as_str())
            .collect();
        COLOR_PALETTE
            .iter()
            .find(|c| !used.contains(c))
            .unwrap_or(&COLOR_PALETTE[0])
            .to_string()
    }
}

#[cfg(test)]
impl SessionManager {
    /// Insert a session with an arbitrary pane, bypassing tmux.
    pub(crate) fn adopt_for_test(&self, session: Session, pane: Arc<dyn PaneAdapter>) {
        self.store.create_session(&session).unwrap();
        let mut inner = self.inner.lock().unwrap();
        inner.panes.insert(session.id.clone(), pane);
        inner.sessions.insert(session.id.clone(), session);
    }
}

fn validate_alias(alias: &str) -> Result<String> {
    let trimmed = alias.trim();
    if trimmed.is_empty() {
        bail!("alias cannot be empty");
    }
    if trimmed.chars().count() > MAX_ALIAS_LEN {
        bail!("alias too long (max {MAX_ALIAS_LEN} chars)");
    }
    Ok(trimmed.to_string())
}
