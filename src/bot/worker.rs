//! Bot Worker (C6, spec §4.6): one instance per `(project_id, bot_token)`.
//!
//! Lifecycle `Created -> Initialized -> Running(Polling|Webhook) -> Stopping
//! -> Stopped` (spec §4.6). A worker is single-consumer of its Telegram
//! updates: the supervisor (C7) is responsible for ensuring at most one
//! polling loop or webhook route is ever active for a given bot token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use teloxide::payloads::{
    DeleteWebhookSetters, GetUpdatesSetters, SendMessageSetters, SendPhotoSetters, SetWebhookSetters,
};
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, ParseMode, UpdateKind};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bot::commands::{self, CommandContext};
use crate::bot::session::SessionStore;
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerEngine;
use crate::store::Store;
use crate::types::ProjectId;

/// Which delivery mode a worker was started in (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Long-polling `getUpdates` loop — development (spec §6 "`NEXT_PUBLIC_APP_URL`").
    Polling,
    /// Telegram calls our HTTP endpoint — production.
    Webhook,
}

/// Worker lifecycle state (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed but `getMe` has not run yet.
    Created,
    /// `getMe` succeeded; no delivery mode selected yet.
    Initialized,
    /// Actively consuming updates in the given mode.
    Running(DeliveryMode),
    /// `stop` has been called; the polling task (if any) is being cancelled.
    Stopping,
    /// Fully torn down; safe to drop or replace.
    Stopped,
}

/// One Telegram bot worker for one project (spec §4.6).
pub struct BotWorker {
    project_id: ProjectId,
    bot: Bot,
    ctx: CommandContext,
    state: AsyncMutex<WorkerState>,
    poll_task: AsyncMutex<Option<JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
}

impl BotWorker {
    /// Construct a worker and validate the token via `getMe` (spec §4.6
    /// "Initialization"). Failure aborts the lifecycle before any mode is
    /// selected.
    pub async fn initialize(
        project_id: ProjectId,
        bot_token: &str,
        store: Store,
        ledger: Arc<LedgerEngine>,
        public_app_url: String,
    ) -> AppResult<Self> {
        let bot = Bot::new(bot_token);
        bot.get_me()
            .await
            .map_err(|e| AppError::ExternalDependency(format!("telegram getMe failed: {e}")))?;

        Ok(Self {
            project_id,
            bot,
            ctx: CommandContext {
                project_id,
                store,
                ledger,
                sessions: Arc::new(SessionStore::new()),
                public_app_url,
            },
            state: AsyncMutex::new(WorkerState::Initialized),
            poll_task: AsyncMutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The project this worker serves.
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    /// Enter `PollingMode` (spec §4.6): delete any previously-set webhook
    /// with `drop_pending_updates=true`, then spawn a cancellable
    /// long-polling task.
    pub async fn start_polling(self: &Arc<Self>) -> AppResult<()> {
        self.bot
            .delete_webhook()
            .drop_pending_updates(true)
            .await
            .map_err(|e| AppError::ExternalDependency(format!("deleteWebhook failed: {e}")))?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.poll_loop().await });
        *self.poll_task.lock().await = Some(handle);
        *self.state.lock().await = WorkerState::Running(DeliveryMode::Polling);
        info!(project_id = %self.project_id, "bot worker entered polling mode");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: i32 = 0;
        while !self.stop_flag.load(Ordering::SeqCst) {
            let batch = self.bot.get_updates().offset(offset).timeout(30).await;

            let updates = match batch {
                Ok(updates) => updates,
                Err(err) => {
                    if is_consumer_conflict(&err) {
                        warn!(project_id = %self.project_id, "getUpdates conflict: another consumer holds this token");
                    } else {
                        warn!(project_id = %self.project_id, error = %err, "getUpdates failed");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for update in updates {
                offset = i32::try_from(update.id.0).unwrap_or(i32::MAX).saturating_add(1);
                self.handle_update(update).await;
            }
        }
    }

    /// Enter `WebhookMode` (spec §4.6): `setWebhook` with
    /// `drop_pending_updates=true` and the allowed update kinds.
    pub async fn start_webhook(&self, webhook_url: &str) -> AppResult<()> {
        let url = webhook_url
            .parse()
            .map_err(|e| AppError::Validation(format!("invalid webhook url: {e}")))?;

        self.bot
            .set_webhook(url)
            .drop_pending_updates(true)
            .allowed_updates(vec![
                AllowedUpdate::Message,
                AllowedUpdate::CallbackQuery,
                AllowedUpdate::InlineQuery,
                AllowedUpdate::ChosenInlineResult,
            ])
            .await
            .map_err(|e| AppError::ExternalDependency(format!("setWebhook failed: {e}")))?;

        *self.state.lock().await = WorkerState::Running(DeliveryMode::Webhook);
        info!(project_id = %self.project_id, "bot worker entered webhook mode");
        Ok(())
    }

    /// The update-handler callable the supervisor routes to from the HTTP
    /// ingress in `WebhookMode` (spec §4.6/§4.7).
    pub async fn handle_webhook_update(&self, update: teloxide::types::Update) {
        self.handle_update(update).await;
    }

    async fn handle_update(&self, update: teloxide::types::Update) {
        match update.kind {
            UpdateKind::Message(msg) => self.handle_message(msg).await,
            UpdateKind::CallbackQuery(query) => self.handle_callback(query).await,
            _ => {}
        }
    }

    async fn handle_message(&self, msg: Message) {
        let Some(from) = msg.from.as_ref() else { return };
        let telegram_id = to_i64(from.id.0);
        let username = from.username.as_deref();
        let chat_id = msg.chat.id;

        if let Some(contact) = msg.contact() {
            commands::handle_shared_contact(&self.bot, chat_id, telegram_id, username, &contact.phone_number, &self.ctx).await;
            return;
        }

        let Some(text) = msg.text() else { return };

        if let Some(command) = text.strip_prefix('/') {
            let name = command.split_whitespace().next().unwrap_or("").split('@').next().unwrap_or("");
            self.dispatch_command(name, chat_id, telegram_id).await;
            return;
        }

        if self.ctx.sessions.is_awaiting_contact(chat_id.0) {
            commands::handle_free_text_email(&self.bot, chat_id, telegram_id, username, text, &self.ctx).await;
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let telegram_id = to_i64(query.from.id.0);
        let chat_id = query.message.as_ref().map(chat_id_of);

        if let (Some(data), Some(chat_id)) = (query.data.as_deref(), chat_id) {
            match data {
                "check_balance" => commands::handle_balance(&self.bot, chat_id, telegram_id, &self.ctx).await,
                "check_level" => commands::handle_level(&self.bot, chat_id, telegram_id, &self.ctx).await,
                "view_history" => commands::handle_history(&self.bot, chat_id, telegram_id, &self.ctx).await,
                "check_referral" => commands::handle_referral(&self.bot, chat_id, telegram_id, &self.ctx).await,
                "get_invite_link" => commands::handle_invite(&self.bot, chat_id, telegram_id, &self.ctx).await,
                "show_help" => commands::handle_help(&self.bot, chat_id).await,
                _ => {}
            }
        }

        if let Err(e) = self.bot.answer_callback_query(query.id).await {
            warn!(project_id = %self.project_id, error = %e, "failed to answer callback query");
        }
    }

    /// Command name → handler dispatch shared between text commands and the
    /// (identically-named) inline callback data values (spec §4.6 table).
    async fn dispatch_command(&self, name: &str, chat_id: ChatId, telegram_id: i64) {
        match name {
            "start" => commands::handle_start(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "balance" => commands::handle_balance(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "level" => commands::handle_level(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "history" => commands::handle_history(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "referral" => commands::handle_referral(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "invite" => commands::handle_invite(&self.bot, chat_id, telegram_id, &self.ctx).await,
            "help" => commands::handle_help(&self.bot, chat_id).await,
            _ => {}
        }
    }

    /// `sendRichBroadcast`'s per-recipient send (spec §4.7): `sendPhoto`
    /// with a caption when `image_url` is set, otherwise `sendMessage`,
    /// both carrying an inline keyboard built from `buttons` in rows of two
    /// by insertion order. `parse_mode` ("HTML"/"Markdown"/"MarkdownV2",
    /// case-insensitive) governs how `message` is rendered; an absent or
    /// unrecognised value sends plain text.
    pub async fn send_rich_message(
        &self,
        telegram_id: i64,
        message: &str,
        image_url: Option<&str>,
        buttons: &[(String, String)],
        parse_mode: Option<&str>,
    ) -> AppResult<()> {
        let chat_id = ChatId(telegram_id);
        let keyboard = build_keyboard(buttons);
        let parse_mode = parse_mode.and_then(parse_mode_from_str);

        let result = match image_url {
            Some(url) => {
                let photo_url: url::Url = url
                    .parse()
                    .map_err(|e| AppError::Validation(format!("invalid image url: {e}")))?;
                let mut req = self.bot.send_photo(chat_id, teloxide::types::InputFile::url(photo_url)).caption(message);
                if let Some(mode) = parse_mode {
                    req = req.parse_mode(mode);
                }
                if let Some(ref keyboard) = keyboard {
                    req = req.reply_markup(keyboard.clone());
                }
                req.await.map(|_| ())
            }
            None => {
                let mut req = self.bot.send_message(chat_id, message);
                if let Some(mode) = parse_mode {
                    req = req.parse_mode(mode);
                }
                if let Some(ref keyboard) = keyboard {
                    req = req.reply_markup(keyboard.clone());
                }
                req.await.map(|_| ())
            }
        };

        result.map_err(|e| AppError::ExternalDependency(format!("broadcast send failed: {e}")))
    }

    /// `stopBot` (spec §4.7): flip state, cancel the polling task with a
    /// 2s grace, then remove the webhook. Always completes even if the
    /// Telegram calls error.
    pub async fn stop(&self) {
        *self.state.lock().await = WorkerState::Stopping;
        self.stop_flag.store(true, Ordering::SeqCst);

        let handle = self.poll_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!(project_id = %self.project_id, "polling task exceeded 2s stop grace; detaching");
            }
        }

        if let Err(e) = self.bot.delete_webhook().drop_pending_updates(true).await {
            warn!(project_id = %self.project_id, error = %e, "deleteWebhook failed during stop");
        }

        *self.state.lock().await = WorkerState::Stopped;
        info!(project_id = %self.project_id, "bot worker stopped");
    }
}

fn to_i64(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(0)
}

/// Lay `buttons` out two per row, in insertion order (spec §4.7
/// "sendRichBroadcast").
fn build_keyboard(buttons: &[(String, String)]) -> Option<InlineKeyboardMarkup> {
    if buttons.is_empty() {
        return None;
    }
    let rows = buttons
        .chunks(2)
        .map(|pair| pair.iter().map(|(text, data)| InlineKeyboardButton::callback(text.clone(), data.clone())).collect())
        .collect();
    Some(InlineKeyboardMarkup::new(rows))
}

/// Maps a caller-supplied `parseMode` string to teloxide's enum,
/// case-insensitively; an unrecognised value falls back to plain text.
fn parse_mode_from_str(mode: &str) -> Option<ParseMode> {
    match mode.to_ascii_lowercase().as_str() {
        "html" => Some(ParseMode::Html),
        "markdown" => Some(ParseMode::Markdown),
        "markdownv2" => Some(ParseMode::MarkdownV2),
        _ => None,
    }
}

fn chat_id_of(message: &MaybeInaccessibleMessage) -> ChatId {
    match message {
        MaybeInaccessibleMessage::Regular(msg) => msg.chat.id,
        MaybeInaccessibleMessage::Inaccessible(msg) => msg.chat.id,
    }
}

/// `true` when `err` is Telegram's "409 / terminated by other getUpdates"
/// lifecycle signature (spec §4.6 "Failure semantics", §4.7 "Global error
/// handler") rather than a genuine failure.
fn is_consumer_conflict(err: &teloxide::RequestError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("409") || text.contains("terminated by other getupdates")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_conflict_detected_from_message_text() {
        let err = teloxide::RequestError::Api(teloxide::ApiError::Unknown(
            "Conflict: terminated by other getUpdates request".to_string(),
        ));
        assert!(is_consumer_conflict(&err));
    }

    #[test]
    fn unrelated_error_is_not_a_consumer_conflict() {
        let err = teloxide::RequestError::Api(teloxide::ApiError::Unknown("Bad Request: chat not found".to_string()));
        assert!(!is_consumer_conflict(&err));
    }
}
