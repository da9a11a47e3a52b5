//! conductor-core
//!
//! Event pipeline for the Conductor daemon: tmux panes are polled,
//! their output canonicalized and classified, and the resulting events
//! dispatched to an auto-responder, a batching notifier, an AI
//! summarization layer, a confirmation manager and a token estimator.
//! The daemon binary in `conductor-daemon` wires these together.

pub mod ai;
pub mod auto;
pub mod classify;
pub mod config;
pub mod confirm;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod notify;
pub mod pane;
pub mod sessions;
pub mod sleep;
pub mod telegram;
pub mod tokens;
pub mod types;
