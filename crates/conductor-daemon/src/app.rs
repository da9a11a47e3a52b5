//! Shared handler state
//!
//! Everything the update handlers need, constructed once at startup and
//! cloned by Arc into the update loop.

use std::sync::{Arc, Mutex};

use conductor_core::ai::Brain;
use conductor_core::auto::AutoResponder;
use conductor_core::config::Config;
use conductor_core::confirm::ConfirmationManager;
use conductor_core::db::Store;
use conductor_core::dispatch::Dispatcher;
use conductor_core::notify::Notifier;
use conductor_core::pane::MonitorEvent;
use conductor_core::sessions::SessionManager;
use conductor_core::telegram::TelegramBot;
use conductor_core::tokens::TokenEstimator;
use tokio::sync::mpsc;

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionManager>,
    pub notifier: Arc<Notifier>,
    pub dispatcher: Arc<Dispatcher>,
    pub responder: Arc<AutoResponder>,
    pub estimator: Arc<TokenEstimator>,
    pub confirmations: Arc<ConfirmationManager>,
    pub brain: Arc<Brain>,
    pub bot: Arc<TelegramBot>,
    pub events_tx: mpsc::Sender<MonitorEvent>,
    /// Session chosen via a `pick:` button, consumed by the next message.
    pub picked_session: Mutex<Option<String>>,
}
