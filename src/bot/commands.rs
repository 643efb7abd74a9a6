//! Command and callback handlers for the bot worker (spec §4.6 table).
//!
//! Every handler is resilient to Telegram API failures: an error sending a
//! reply is logged and swallowed rather than propagated, since a chat's
//! session must continue even after a transient failure (spec §4.6
//! "Failure semantics").

use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::warn;

use crate::bot::session::{LinkingMethod, SessionStore};
use crate::bot::ui;
use crate::error::AppResult;
use crate::ledger::LedgerEngine;
use crate::levels;
use crate::referral;
use crate::store::Store;
use crate::types::ProjectId;

/// Shared collaborators every command handler needs.
#[derive(Clone)]
pub struct CommandContext {
    pub project_id: ProjectId,
    pub store: Store,
    pub ledger: std::sync::Arc<LedgerEngine>,
    pub sessions: std::sync::Arc<SessionStore>,
    pub public_app_url: String,
}

async fn send_html(bot: &Bot, chat_id: ChatId, text: String) {
    if let Err(e) = bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await {
        warn!(error = %e, %chat_id, "failed to send telegram message");
    }
}

/// `/start` (spec §4.6). Shows the menu for a linked user, otherwise opens
/// the registration dialog.
pub async fn handle_start(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    let user = ctx.store.find_user_by_telegram(ctx.project_id, telegram_id).await;

    match user {
        Ok(Some(_)) => {
            if let Err(e) = bot
                .send_message(chat_id, "С возвращением! Выберите действие:")
                .reply_markup(ui::main_menu_keyboard())
                .await
            {
                warn!(error = %e, "failed to send start menu");
            }
        }
        Ok(None) => {
            let settings = ctx.store.get_bot_settings(ctx.project_id).await.ok().flatten();
            let welcome = settings.map(|s| s.welcome_message).unwrap_or_default();
            if let Err(e) = bot
                .send_message(chat_id, ui::format_welcome(&welcome))
                .parse_mode(ParseMode::Html)
                .reply_markup(ui::share_contact_keyboard())
                .await
            {
                warn!(error = %e, "failed to send welcome message");
            }
            ctx.sessions.begin_registration(chat_id.0, LinkingMethod::Contact);
        }
        Err(e) => warn!(error = %e, "failed to look up telegram user on /start"),
    }
}

/// `/balance`, `check_balance` (spec §4.6).
pub async fn handle_balance(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    match require_linked_user(ctx, telegram_id).await {
        Ok(Some(user)) => match ctx.ledger.get_balance(user.id).await {
            Ok(balance) => send_html(bot, chat_id, ui::format_balance(&balance)).await,
            Err(e) => warn!(error = %e, "failed to compute balance"),
        },
        Ok(None) => send_html(bot, chat_id, not_linked_message()).await,
        Err(e) => warn!(error = %e, "failed to look up user for /balance"),
    }
}

/// `/level`, `check_level` (spec §4.6).
pub async fn handle_level(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    match require_linked_user(ctx, telegram_id).await {
        Ok(Some(user)) => match ctx.store.list_active_levels(ctx.project_id).await {
            Ok(active_levels) => {
                let progress = levels::progress_to_next(&active_levels, user.total_purchases);
                send_html(bot, chat_id, ui::format_level(&progress)).await;
            }
            Err(e) => warn!(error = %e, "failed to load levels"),
        },
        Ok(None) => send_html(bot, chat_id, not_linked_message()).await,
        Err(e) => warn!(error = %e, "failed to look up user for /level"),
    }
}

/// `/history`, `view_history` (spec §4.6). Shows the last 10 transactions.
pub async fn handle_history(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    match require_linked_user(ctx, telegram_id).await {
        Ok(Some(user)) => match ctx.store.list_recent_transactions(user.id, 10).await {
            Ok(transactions) => send_html(bot, chat_id, ui::format_history(&transactions)).await,
            Err(e) => warn!(error = %e, "failed to load history"),
        },
        Ok(None) => send_html(bot, chat_id, not_linked_message()).await,
        Err(e) => warn!(error = %e, "failed to look up user for /history"),
    }
}

/// `/referral`, `check_referral` (spec §4.6).
pub async fn handle_referral(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    match require_linked_user(ctx, telegram_id).await {
        Ok(Some(user)) => {
            let program = ctx.store.get_referral_program(ctx.project_id).await.ok().flatten();
            let Some(program) = program else {
                send_html(bot, chat_id, "Реферальная программа не настроена.".to_string()).await;
                return;
            };
            let referral_count = ctx.store.count_referrals(user.id).await.unwrap_or(0);
            send_html(bot, chat_id, ui::format_referral_terms(program.referrer_bonus_percent, referral_count)).await;
        }
        Ok(None) => send_html(bot, chat_id, not_linked_message()).await,
        Err(e) => warn!(error = %e, "failed to look up user for /referral"),
    }
}

/// `/invite`, `get_invite_link` (spec §4.6).
pub async fn handle_invite(bot: &Bot, chat_id: ChatId, telegram_id: i64, ctx: &CommandContext) {
    match require_linked_user(ctx, telegram_id).await {
        Ok(Some(user)) => match referral::ensure_user_referral_code(&ctx.store, user.id).await {
            Ok(_code) => match referral::generate_link(user.id, &ctx.public_app_url, &[]) {
                Ok(link) => send_html(bot, chat_id, ui::format_invite(&link)).await,
                Err(e) => warn!(error = %e, "failed to build invite link"),
            },
            Err(e) => warn!(error = %e, "failed to ensure referral code"),
        },
        Ok(None) => send_html(bot, chat_id, not_linked_message()).await,
        Err(e) => warn!(error = %e, "failed to look up user for /invite"),
    }
}

/// `/help`, `show_help` (spec §4.6).
pub async fn handle_help(bot: &Bot, chat_id: ChatId) {
    send_html(bot, chat_id, ui::format_help()).await;
}

/// Shared-contact registration path (spec §4.6).
pub async fn handle_shared_contact(
    bot: &Bot,
    chat_id: ChatId,
    telegram_id: i64,
    username: Option<&str>,
    phone: &str,
    ctx: &CommandContext,
) {
    match link_telegram_account(ctx, telegram_id, username, None, Some(phone)).await {
        Ok(()) => {
            ctx.sessions.clear(chat_id.0);
            if let Err(e) = bot
                .send_message(chat_id, "Регистрация завершена! Выберите действие:")
                .reply_markup(ui::main_menu_keyboard())
                .await
            {
                warn!(error = %e, "failed to confirm contact registration");
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to link telegram account via contact");
            send_html(bot, chat_id, "Не удалось завершить регистрацию. Попробуйте ещё раз.".to_string()).await;
        }
    }
}

/// Free-text email registration path, only active while `awaitingContact`
/// (spec §4.6).
pub async fn handle_free_text_email(bot: &Bot, chat_id: ChatId, telegram_id: i64, username: Option<&str>, text: &str, ctx: &CommandContext) {
    let email = text.trim();
    if !is_valid_email(email) {
        send_html(bot, chat_id, "Похоже, это не email. Введите корректный адрес или поделитесь номером.".to_string()).await;
        return;
    }

    match link_telegram_account(ctx, telegram_id, username, Some(email), None).await {
        Ok(()) => {
            ctx.sessions.clear(chat_id.0);
            if let Err(e) = bot
                .send_message(chat_id, "Регистрация завершена! Выберите действие:")
                .reply_markup(ui::main_menu_keyboard())
                .await
            {
                warn!(error = %e, "failed to confirm email registration");
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to link telegram account via email");
            send_html(bot, chat_id, "Не удалось завершить регистрацию. Попробуйте ещё раз.".to_string()).await;
        }
    }
}

async fn require_linked_user(ctx: &CommandContext, telegram_id: i64) -> AppResult<Option<crate::store::models::User>> {
    Ok(ctx.store.find_user_by_telegram(ctx.project_id, telegram_id).await?)
}

fn not_linked_message() -> String {
    "Сначала пройдите регистрацию: отправьте /start.".to_string()
}

fn is_valid_email(candidate: &str) -> bool {
    let Ok(re) = regex::Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$") else {
        return false;
    };
    re.is_match(candidate)
}

/// `linkTelegramAccount(project, telegramId, username, {phone|email})`
/// (spec §4.6). Finds the user by whichever contact was supplied, or
/// creates one, then links the Telegram identity.
async fn link_telegram_account(
    ctx: &CommandContext,
    telegram_id: i64,
    username: Option<&str>,
    email: Option<&str>,
    phone: Option<&str>,
) -> AppResult<()> {
    let existing = match (email, phone) {
        (Some(email), _) => ctx.store.find_user_by_email(ctx.project_id, email).await?,
        (_, Some(phone)) => ctx.store.find_user_by_phone(ctx.project_id, phone).await?,
        _ => None,
    };

    let mut uow = ctx.store.begin().await?;
    let user = match existing {
        Some(user) => user,
        None => {
            uow.create_user(crate::store::NewUser {
                project_id: ctx.project_id,
                email,
                phone,
                first_name: None,
                last_name: None,
                utm_source: None,
            })
            .await?
        }
    };
    uow.link_telegram(user.id, telegram_id, username).await?;
    uow.commit().await?;
    Ok(())
}
