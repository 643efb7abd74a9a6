//! Telegram bot surface (spec §4.6, §4.7): command/callback handlers, the
//! per-chat session store, message templates, and the worker lifecycle that
//! ties them to a running `teloxide::Bot`.

pub mod commands;
pub mod session;
pub mod ui;
pub mod worker;

pub use worker::{BotWorker, DeliveryMode, WorkerState};
