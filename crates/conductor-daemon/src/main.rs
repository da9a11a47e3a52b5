//! conductord — the Conductor daemon
//!
//! Startup: load config, wire every component, recover leftover tmux
//! sessions, then serve Telegram updates until SIGINT/SIGTERM. Exit
//! codes: 0 normal shutdown, 64 invalid configuration, 70 fatal internal
//! error.

mod app;
mod callbacks;
mod commands;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use conductor_core::ai::{AnthropicClient, Brain};
use conductor_core::auto::AutoResponder;
use conductor_core::config::{conductor_home, db_path, Config};
use conductor_core::confirm::ConfirmationManager;
use conductor_core::db::Store;
use conductor_core::dispatch::Dispatcher;
use conductor_core::errors::ErrorEscalator;
use conductor_core::notify::Notifier;
use conductor_core::pane::TmuxClient;
use conductor_core::sessions::SessionManager;
use conductor_core::sleep::SleepDetector;
use conductor_core::telegram::{ChatTransport, TelegramBot, Update};
use conductor_core::tokens::TokenEstimator;
use conductor_core::types::MatchType;

use crate::app::App;

const EXIT_CONFIG: u8 = 64;
const EXIT_INTERNAL: u8 = 70;

/// Health sweep period for dead-PID detection.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// Confirmation sweeper period.
const CONFIRM_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Long-poll timeout for updates.
const POLL_TIMEOUT_SECS: u64 = 30;

fn main() -> ExitCode {
    let home = conductor_home();
    let _ = std::fs::create_dir_all(home.join("logs"));

    let config = Config::load();
    let missing = config.validate();
    if !missing.is_empty() {
        eprintln!("❌ Missing required config: {}", missing.join(", "));
        eprintln!("   Set them in {}", home.join(".env").display());
        return ExitCode::from(EXIT_CONFIG);
    }

    // Dual-layer logging: stderr + daily-rotated file.
    let file_appender = tracing_appender::rolling::daily(home.join("logs"), "conductor.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false),
    );
    if config.prefs.logging.console_output {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry.init();
    }

    // Panics should reach the log file, not just stderr.
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {location}: {payload}");
        error!(location = %location, "DAEMON PANIC: {payload}");
    }));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("Conductor stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("🎛️ Conductor starting up");
    let config = Arc::new(config);

    // Store: open, prune, seed rules.
    let store = Arc::new(Store::open(db_path()).context("failed to open database")?);
    match store.prune_old_records() {
        Ok(0) => {}
        Ok(n) => info!(count = n, "Pruned old commands/events"),
        Err(e) => warn!(error = %e, "Pruning failed"),
    }
    if config.prefs.auto_responder.enabled {
        let defaults: Vec<(String, String, MatchType)> = config
            .prefs
            .auto_responder
            .default_rules
            .iter()
            .map(|rule| {
                (
                    rule.pattern.clone(),
                    rule.response.clone(),
                    MatchType::parse(&rule.match_type).unwrap_or(MatchType::Contains),
                )
            })
            .collect();
        let _ = store.seed_default_rules(&defaults);
    }

    // Escalation channel, transport, notifier.
    let (escalator, mut alerts_rx) = ErrorEscalator::new();
    let escalator = Arc::new(escalator);
    let bot = Arc::new(TelegramBot::new(
        &config.telegram_bot_token,
        config.telegram_user_id,
    ));
    let transport: Arc<dyn ChatTransport> = bot.clone();
    let notifier = Arc::new(Notifier::new(
        transport,
        config.prefs.notifications.clone(),
        escalator.clone(),
    ));

    // AI brain over the Anthropic Messages API.
    let model = Arc::new(AnthropicClient::new(
        &config.anthropic_api_key,
        &config.prefs.ai.model,
    ));
    let brain = Arc::new(Brain::new(model, config.prefs.ai.clone(), escalator.clone()));

    let responder = Arc::new(AutoResponder::new(
        store.clone(),
        config.prefs.auto_responder.enabled,
    ));
    let estimator = Arc::new(TokenEstimator::new(config.prefs.tokens.clone()));
    let confirmations = Arc::new(ConfirmationManager::new(Duration::from_secs(
        config.prefs.notifications.confirmation_timeout_s,
    )));

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        TmuxClient::new(),
        config.prefs.sessions.clone(),
        config.prefs.monitor.clone(),
        estimator.tier_limit(),
    ));
    let loaded = sessions.load_from_store()?;
    info!(count = loaded, "Sessions loaded from store");

    let (events_tx, events_rx) = mpsc::channel(256);
    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        store.clone(),
        notifier.clone(),
        brain.clone(),
        responder.clone(),
        estimator.clone(),
    ));
    tokio::spawn(dispatcher.clone().run(events_rx));

    // Shutdown fan-out for the background loops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(notifier.clone().run_batch_flusher(shutdown_rx.clone()));
    tokio::spawn(notifier.clone().run_liveness_checker(shutdown_rx.clone()));

    // Escalation alerts go out as immediate system messages.
    {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            while let Some(alert) = alerts_rx.recv().await {
                notifier.send_immediate(&alert, None, false).await;
            }
        });
    }

    // Confirmation sweeper.
    {
        let confirmations = confirmations.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CONFIRM_SWEEP_INTERVAL) => {
                        confirmations.cleanup_expired();
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Sleep detector: a wake triggers a health sweep.
    let (sleep_detector, mut wake_rx) = SleepDetector::new();
    tokio::spawn(sleep_detector.run(shutdown_rx.clone()));
    {
        let sessions = sessions.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            while let Some(wake) = wake_rx.recv().await {
                let mins = wake.slept_for.as_secs() / 60;
                let secs = wake.slept_for.as_secs() % 60;
                let dead = sessions.health_sweep().await;
                let mut body =
                    format!("💤 Machine slept for {mins}m {secs}s — session health check done.");
                for session in &dead {
                    body.push_str(&format!("\n⚪ {} ended while asleep.", session.label()));
                }
                notifier.send_immediate(&body, None, true).await;
            }
        });
    }

    // Periodic dead-PID sweep.
    {
        let sessions = sessions.clone();
        let notifier = notifier.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEALTH_INTERVAL) => {
                        for session in sessions.health_sweep().await {
                            notifier
                                .send_immediate(
                                    &format!("⚪ {} ended (process died).", session.label()),
                                    None,
                                    false,
                                )
                                .await;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Adopt tmux sessions left over from a previous daemon run.
    match sessions.recover_sessions().await {
        Ok(recovered) if !recovered.is_empty() => {
            for session in &recovered {
                sessions.start_monitor(session, events_tx.clone());
            }
            notifier
                .send_immediate(
                    &format!("🔄 Conductor restarted — recovered {} session(s).", recovered.len()),
                    None,
                    false,
                )
                .await;
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Session recovery failed"),
    }
    // Monitors for sessions that were already in the store.
    for session in sessions.list() {
        if sessions.monitor_control(&session.id).is_none() && sessions.get_pane(&session.id).is_some()
        {
            sessions.start_monitor(&session, events_tx.clone());
        }
    }

    // Command menu registration is best effort.
    if let Err(e) = bot
        .set_commands(&[
            ("status", "Session dashboard"),
            ("new", "Create session (cc|sh <dir>)"),
            ("input", "Send text to session"),
            ("run", "Run command in session"),
            ("output", "Latest summary"),
            ("tokens", "Token usage overview"),
            ("pause", "Pause session or auto-responder"),
            ("resume", "Resume session or auto-responder"),
            ("kill", "Kill a session"),
            ("restart", "Restart a session"),
            ("rename", "Rename a session"),
            ("auto", "Auto-responder rules"),
            ("help", "Command reference"),
        ])
        .await
    {
        warn!(error = %e, "Failed to register command menu");
    }

    let app = Arc::new(App {
        config: config.clone(),
        store: store.clone(),
        sessions: sessions.clone(),
        notifier: notifier.clone(),
        dispatcher,
        responder,
        estimator,
        confirmations,
        brain,
        bot: bot.clone(),
        events_tx: events_tx.clone(),
        picked_session: Mutex::new(None),
    });

    info!("🚀 Conductor is online, polling for updates");
    serve_updates(app, shutdown_tx).await;

    // Shutdown: stop monitors first so the dispatcher channel drains and
    // closes, flush the notifier (bounded inside the flusher), store last.
    for session in sessions.list() {
        if let Some(control) = sessions.monitor_control(&session.id) {
            control.stop();
        }
    }
    drop(events_tx);
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Long-poll loop. Returns when a shutdown signal arrives; the watch
/// channel tells every background loop to wind down.
async fn serve_updates(app: Arc<App>, shutdown_tx: watch::Sender<bool>) {
    let mut offset = 0i64;

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    loop {
        #[cfg(unix)]
        let term = async {
            match sigterm.as_mut() {
                Some(sig) => {
                    sig.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = term => {
                info!("SIGTERM received, shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            result = app.bot.get_updates(offset, POLL_TIMEOUT_SECS) => {
                match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            handle_update(&app, update).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "getUpdates failed, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}

async fn handle_update(app: &Arc<App>, update: Update) {
    if let Some(message) = update.message {
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(0);
        if user_id != app.config.telegram_user_id {
            warn!(user_id, "Unauthorized message");
            app.notifier
                .send_immediate("⛔ Unauthorized. This bot is private.", None, true)
                .await;
            return;
        }
        let Some(text) = message.text else { return };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if text.starts_with('/') {
            commands::handle_command(app, user_id, text).await;
        } else {
            commands::handle_natural(app, user_id, text).await;
        }
    } else if let Some(callback) = update.callback_query {
        if callback.from.id != app.config.telegram_user_id {
            warn!(user_id = callback.from.id, "Unauthorized callback");
            let _ = app.bot.answer_callback(&callback.id, Some("⛔ Unauthorized.")).await;
            return;
        }
        callbacks::handle_callback(app, callback).await;
    }
}
