//! HTML formatting and inline keyboard helpers for Telegram messages.
//!
//! All output uses HTML parse mode, matching project convention for
//! Telegram delivery (never MarkdownV2 — its escaping rules are too easy
//! to get wrong against user-supplied text).

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::ledger::Balance;
use crate::levels::LevelProgress;
use crate::store::models::Transaction;
use crate::types::TransactionType;

/// Escape special HTML characters in user-provided text.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// The main menu shown after `/start` for a linked user.
pub fn main_menu_keyboard() -> InlineKeyboardMarkup {
    let rows = vec![
        vec![
            InlineKeyboardButton::callback("\u{1F4B0} Баланс".to_owned(), "check_balance"),
            InlineKeyboardButton::callback("\u{2B50} Уровень".to_owned(), "check_level"),
        ],
        vec![
            InlineKeyboardButton::callback("\u{1F4DC} История".to_owned(), "view_history"),
            InlineKeyboardButton::callback("\u{1F91D} Рефералы".to_owned(), "check_referral"),
        ],
        vec![
            InlineKeyboardButton::callback("\u{1F4E8} Пригласить".to_owned(), "get_invite_link"),
            InlineKeyboardButton::callback("\u{2753} Помощь".to_owned(), "show_help"),
        ],
    ];
    InlineKeyboardMarkup::new(rows)
}

/// The share-contact keyboard offered during registration.
pub fn share_contact_keyboard() -> teloxide::types::KeyboardMarkup {
    use teloxide::types::KeyboardButton;
    let button = KeyboardButton::new("\u{1F4DE} Поделиться номером").request(teloxide::types::ButtonRequest::Contact);
    teloxide::types::KeyboardMarkup::new(vec![vec![button]]).resize_keyboard()
}

/// `getBalance` rendered for chat display.
pub fn format_balance(balance: &Balance) -> String {
    format!(
        "<b>\u{1F4B0} Ваш баланс</b>\n\nТекущий баланс: <b>{}</b>\nВсего начислено: {}\nВсего потрачено: {}\nСкоро сгорит: {}",
        balance.current_balance, balance.total_earned, balance.total_spent, balance.expiring_soon
    )
}

/// `progressToNext` rendered with a 10-block progress bar (spec §4.6).
pub fn format_level(progress: &LevelProgress<'_>) -> String {
    use rust_decimal::prelude::ToPrimitive;
    let blocks_filled = (progress.progress_percent / rust_decimal::Decimal::from(10))
        .round()
        .to_i64()
        .unwrap_or(0)
        .clamp(0, 10);
    let bar: String = (0..10)
        .map(|i| if i64::from(i) < blocks_filled { '\u{2588}' } else { '\u{2591}' })
        .collect();

    let current_name = progress.current.map(|l| l.name.as_str()).unwrap_or("Базовый");
    let mut text = format!("<b>\u{2B50} Ваш уровень: {}</b>\n\n{bar} {}%\n", escape_html(current_name), progress.progress_percent);

    if let Some(next) = progress.next {
        text.push_str(&format!(
            "\nДо уровня <b>{}</b> осталось: {}",
            escape_html(&next.name),
            progress.amount_needed
        ));
    } else {
        text.push_str("\nЭто максимальный уровень.");
    }
    text
}

/// Last 5-10 transactions, newest first, sign-prefixed (spec §4.6).
pub fn format_history(transactions: &[Transaction]) -> String {
    if transactions.is_empty() {
        return "<b>\u{1F4DC} История операций</b>\n\nПока нет операций.".to_string();
    }

    let mut lines = vec!["<b>\u{1F4DC} История операций</b>".to_string(), String::new()];
    for tx in transactions {
        let sign = match tx.kind() {
            TransactionType::Earn => '+',
            TransactionType::Spend | TransactionType::Expire => '-',
            TransactionType::AdminAdjust => '\u{00B1}',
        };
        lines.push(format!(
            "{sign}{} — {} ({})",
            tx.amount,
            escape_html(&tx.description),
            tx.created_at.format("%d.%m.%Y")
        ));
    }
    lines.join("\n")
}

/// Static help text (spec §4.6 `/help`).
pub fn format_help() -> String {
    "<b>\u{2753} Доступные команды</b>\n\n\
     /balance — баланс бонусов\n\
     /level — уровень и прогресс\n\
     /history — история операций\n\
     /referral — реферальная программа\n\
     /invite — пригласить друга\n\
     /help — это сообщение"
        .to_string()
}

/// `/referral` program terms + stats (spec §4.6).
pub fn format_referral_terms(referrer_bonus_percent: rust_decimal::Decimal, referral_count: i64) -> String {
    format!(
        "<b>\u{1F91D} Реферальная программа</b>\n\n\
         Приглашайте друзей и получайте <b>{referrer_bonus_percent}%</b> от их покупок бонусами.\n\
         Приглашено друзей: <b>{referral_count}</b>"
    )
}

/// Deterministic formatting of an invite link message (spec §4.6 `/invite`).
pub fn format_invite(link: &str) -> String {
    format!("<b>\u{1F4E8} Ваша пригласительная ссылка</b>\n\n{link}")
}

/// The welcome message shown to an unregistered user, plus a prompt to
/// choose a registration path.
pub fn format_welcome(welcome_message: &str) -> String {
    if welcome_message.is_empty() {
        "<b>Добро пожаловать!</b>\n\nПоделитесь номером телефона или отправьте email для регистрации.".to_string()
    } else {
        format!("{}\n\nПоделитесь номером телефона или отправьте email для регистрации.", escape_html(welcome_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_escapes_reserved_chars() {
        assert_eq!(escape_html("<b>&"), "&lt;b&gt;&amp;");
    }

    #[test]
    fn format_history_handles_empty_list() {
        let text = format_history(&[]);
        assert!(text.contains("Пока нет операций"));
    }
}
