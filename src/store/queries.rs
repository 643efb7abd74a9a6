//! Query implementations shared between [`super::Store`] (read-only, runs
//! against the pool) and [`super::UnitOfWork`] (runs inside one transaction).
//!
//! Every function is generic over `sqlx::PgExecutor` so both callers share
//! one implementation instead of duplicating SQL, generalized to two
//! executor shapes because the ledger needs real multi-statement
//! transactions on top of plain reads.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::money::Money;
use crate::store::models::{
    BonusLevel, BonusLot, BotSettings, NotificationLog, Project, ReferralProgram, Transaction, User,
};
use crate::types::{BonusLotId, ProjectId, TransactionType, UserId};

pub async fn find_project_by_webhook_secret<'e>(
    exec: impl PgExecutor<'e>,
    secret: &str,
) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE webhook_secret = $1")
        .bind(secret)
        .fetch_optional(exec)
        .await
}

pub async fn find_project<'e>(exec: impl PgExecutor<'e>, id: ProjectId) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
}

pub async fn find_user_by_email<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE project_id = $1 AND email = $2")
        .bind(project_id)
        .bind(email)
        .fetch_optional(exec)
        .await
}

pub async fn find_user_by_phone<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
    phone: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE project_id = $1 AND phone = $2")
        .bind(project_id)
        .bind(phone)
        .fetch_optional(exec)
        .await
}

/// Project-scoped Telegram lookup: a single-index `telegram_id`-only
/// variant would collide across projects sharing the same Telegram user,
/// so the project id is always part of the key.
pub async fn find_user_by_telegram<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
    telegram_id: i64,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE project_id = $1 AND telegram_id = $2")
        .bind(project_id)
        .bind(telegram_id)
        .fetch_optional(exec)
        .await
}

pub async fn find_user<'e>(exec: impl PgExecutor<'e>, id: UserId) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
}

pub async fn find_user_by_referral_code<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
    code: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE project_id = $1 AND referral_code = $2")
        .bind(project_id)
        .bind(code)
        .fetch_optional(exec)
        .await
}

pub async fn list_active_levels<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
) -> Result<Vec<BonusLevel>, sqlx::Error> {
    sqlx::query_as::<_, BonusLevel>(
        "SELECT * FROM bonus_levels WHERE project_id = $1 AND is_active = TRUE ORDER BY sort_order ASC",
    )
    .bind(project_id)
    .fetch_all(exec)
    .await
}

pub async fn count_levels<'e>(exec: impl PgExecutor<'e>, project_id: ProjectId) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bonus_levels WHERE project_id = $1")
        .bind(project_id)
        .fetch_one(exec)
        .await?;
    Ok(row.0)
}

/// Count of users a given user has referred, for the `/referral` command's
/// aggregate stats (spec §4.6 table).
pub async fn count_referrals<'e>(exec: impl PgExecutor<'e>, referrer_id: UserId) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE referred_by = $1")
        .bind(referrer_id)
        .fetch_one(exec)
        .await?;
    Ok(row.0)
}

pub async fn get_referral_program<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
) -> Result<Option<ReferralProgram>, sqlx::Error> {
    sqlx::query_as::<_, ReferralProgram>("SELECT * FROM referral_programs WHERE project_id = $1")
        .bind(project_id)
        .fetch_optional(exec)
        .await
}

pub async fn get_bot_settings<'e>(
    exec: impl PgExecutor<'e>,
    project_id: ProjectId,
) -> Result<Option<BotSettings>, sqlx::Error> {
    sqlx::query_as::<_, BotSettings>("SELECT * FROM bot_settings WHERE project_id = $1")
        .bind(project_id)
        .fetch_optional(exec)
        .await
}

/// Every project with an active bot configured, for boot-time warm-up of
/// the supervisor's worker registry.
pub async fn list_active_bot_settings<'e>(exec: impl PgExecutor<'e>) -> Result<Vec<BotSettings>, sqlx::Error> {
    sqlx::query_as::<_, BotSettings>(
        "SELECT bs.* FROM bot_settings bs
         JOIN projects p ON p.id = bs.project_id
         WHERE bs.is_active = TRUE AND p.is_active = TRUE",
    )
    .fetch_all(exec)
    .await
}

/// Spendable lots in FIFO order: ascending `expires_at` (nulls last), tie
/// broken by `created_at` then `id` (spec §4.2 "spend").
pub async fn list_available_lots<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<BonusLot>, sqlx::Error> {
    sqlx::query_as::<_, BonusLot>(
        "SELECT * FROM bonus_lots
         WHERE user_id = $1 AND is_used = FALSE AND (expires_at IS NULL OR expires_at > $2)
         ORDER BY (expires_at IS NULL) ASC, expires_at ASC, created_at ASC, id ASC",
    )
    .bind(user_id)
    .bind(now)
    .fetch_all(exec)
    .await
}

/// All lots past their expiry that still carry a remaining amount
/// (spec §4.2 `expireDueLots`).
pub async fn list_due_lots_for_expiry<'e>(
    exec: impl PgExecutor<'e>,
    now: DateTime<Utc>,
) -> Result<Vec<BonusLot>, sqlx::Error> {
    sqlx::query_as::<_, BonusLot>(
        "SELECT * FROM bonus_lots WHERE is_used = FALSE AND expires_at IS NOT NULL AND expires_at <= $1",
    )
    .bind(now)
    .fetch_all(exec)
    .await
}

/// Lots expiring within `(now, now + horizon]`, still spendable.
pub async fn list_expiring_lots<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    now: DateTime<Utc>,
    horizon: chrono::Duration,
) -> Result<Vec<BonusLot>, sqlx::Error> {
    let cutoff = now + horizon;
    sqlx::query_as::<_, BonusLot>(
        "SELECT * FROM bonus_lots
         WHERE user_id = $1 AND is_used = FALSE AND expires_at IS NOT NULL
           AND expires_at > $2 AND expires_at <= $3",
    )
    .bind(user_id)
    .bind(now)
    .bind(cutoff)
    .fetch_all(exec)
    .await
}

pub async fn sum_by_type<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    kind: TransactionType,
) -> Result<Money, sqlx::Error> {
    let row: (Option<rust_decimal::Decimal>,) =
        sqlx::query_as("SELECT SUM(amount) FROM transactions WHERE user_id = $1 AND transaction_type = $2")
            .bind(user_id)
            .bind(kind.to_string())
            .fetch_one(exec)
            .await?;
    Ok(Money::new(row.0.unwrap_or_default()))
}

/// Idempotency lookup for purchase accrual (spec §4.1, §4.2).
pub async fn find_purchase_earn_by_order<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    order_id: &str,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions
         WHERE user_id = $1 AND transaction_type = 'EARN'
           AND metadata->>'bonusType' = 'PURCHASE' AND metadata->>'orderId' = $2",
    )
    .bind(user_id)
    .bind(order_id)
    .fetch_optional(exec)
    .await
}

/// Idempotency lookup for the linked promocode spend (spec §4.5 step 4).
pub async fn find_spend_marker_by_order<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    order_id: &str,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions
         WHERE user_id = $1 AND transaction_type = 'SPEND' AND metadata->>'spendOrderId' = $2
         LIMIT 1",
    )
    .bind(user_id)
    .bind(order_id)
    .fetch_optional(exec)
    .await
}

pub async fn list_recent_transactions<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    limit: i64,
) -> Result<Vec<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(exec)
    .await
}

// ---------------------------------------------------------------------------
// Writes — only ever called through a `UnitOfWork`.
// ---------------------------------------------------------------------------

pub struct NewUser<'a> {
    pub project_id: ProjectId,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub utm_source: Option<&'a str>,
}

pub async fn create_user<'e>(exec: impl PgExecutor<'e>, new: NewUser<'_>) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (id, project_id, email, phone, first_name, last_name, total_purchases,
                             current_level_name, utm_source, is_active)
         VALUES ($1, $2, $3, $4, $5, $6, 0, 'Base', $7, TRUE)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.project_id)
    .bind(new.email)
    .bind(new.phone)
    .bind(new.first_name)
    .bind(new.last_name)
    .bind(new.utm_source)
    .fetch_one(exec)
    .await
}

pub async fn set_referred_by<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    referrer_id: UserId,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET referred_by = $2 WHERE id = $1 AND referred_by IS NULL")
        .bind(user_id)
        .bind(referrer_id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn set_referral_code<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    code: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET referral_code = $2 WHERE id = $1 AND referral_code IS NULL")
        .bind(user_id)
        .bind(code)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn link_telegram<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    telegram_id: i64,
    username: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET telegram_id = $2, telegram_username = $3 WHERE id = $1")
        .bind(user_id)
        .bind(telegram_id)
        .bind(username)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn update_user_purchase_totals<'e>(
    exec: impl PgExecutor<'e>,
    user_id: UserId,
    new_total: Money,
    level_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET total_purchases = $2, current_level_name = $3 WHERE id = $1")
        .bind(user_id)
        .bind(new_total)
        .bind(level_name)
        .execute(exec)
        .await?;
    Ok(())
}

pub struct NewBonusLot<'a> {
    pub user_id: UserId,
    pub amount: Money,
    pub bonus_type: &'a str,
    pub description: &'a str,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn insert_bonus_lot<'e>(exec: impl PgExecutor<'e>, new: NewBonusLot<'_>) -> Result<BonusLot, sqlx::Error> {
    sqlx::query_as::<_, BonusLot>(
        "INSERT INTO bonus_lots (id, user_id, amount, bonus_type, description, expires_at, is_used)
         VALUES ($1, $2, $3, $4, $5, $6, FALSE)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.user_id)
    .bind(new.amount)
    .bind(new.bonus_type)
    .bind(new.description)
    .bind(new.expires_at)
    .fetch_one(exec)
    .await
}

pub struct NewTransaction<'a> {
    pub user_id: UserId,
    pub bonus_id: Option<BonusLotId>,
    pub transaction_type: &'a str,
    pub amount: Money,
    pub description: &'a str,
    pub order_id: Option<&'a str>,
    pub bonus_type: Option<&'a str>,
    pub spend_order_id: Option<&'a str>,
    pub user_level: Option<&'a str>,
    pub applied_percent: Option<rust_decimal::Decimal>,
    pub is_referral_bonus: bool,
}

pub async fn insert_transaction<'e>(
    exec: impl PgExecutor<'e>,
    new: NewTransaction<'_>,
) -> Result<Transaction, sqlx::Error> {
    let mut metadata = json!({});
    if let Some(order_id) = new.order_id {
        metadata["orderId"] = json!(order_id);
    }
    if let Some(bonus_type) = new.bonus_type {
        metadata["bonusType"] = json!(bonus_type);
    }
    if let Some(spend_order_id) = new.spend_order_id {
        metadata["spendOrderId"] = json!(spend_order_id);
    }

    sqlx::query_as::<_, Transaction>(
        "INSERT INTO transactions (id, user_id, bonus_id, transaction_type, amount, description,
                                    metadata, user_level, applied_percent, is_referral_bonus)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.user_id)
    .bind(new.bonus_id)
    .bind(new.transaction_type)
    .bind(new.amount)
    .bind(new.description)
    .bind(metadata)
    .bind(new.user_level)
    .bind(new.applied_percent)
    .bind(new.is_referral_bonus)
    .fetch_one(exec)
    .await
}

/// Decrement a lot's remaining amount by `taken`, marking it used when the
/// remainder reaches zero (spend) or unconditionally (expire).
pub async fn decrement_lot<'e>(
    exec: impl PgExecutor<'e>,
    lot_id: BonusLotId,
    taken: Money,
    force_used: bool,
) -> Result<(), sqlx::Error> {
    if force_used {
        sqlx::query("UPDATE bonus_lots SET amount = $2, is_used = TRUE WHERE id = $1")
            .bind(lot_id)
            .bind(Money::ZERO)
            .execute(exec)
            .await?;
    } else {
        sqlx::query(
            "UPDATE bonus_lots SET amount = amount - $2, is_used = (amount - $2) <= 0 WHERE id = $1",
        )
        .bind(lot_id)
        .bind(taken)
        .execute(exec)
        .await?;
    }
    Ok(())
}

pub struct NewNotificationLog<'a> {
    pub project_id: ProjectId,
    pub user_id: Option<UserId>,
    pub channel: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub metadata: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
}

pub async fn insert_notification_log<'e>(
    exec: impl PgExecutor<'e>,
    new: NewNotificationLog<'_>,
) -> Result<NotificationLog, sqlx::Error> {
    sqlx::query_as::<_, NotificationLog>(
        "INSERT INTO notification_logs (id, project_id, user_id, channel, title, message, metadata, sent_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.project_id)
    .bind(new.user_id)
    .bind(new.channel)
    .bind(new.title)
    .bind(new.message)
    .bind(new.metadata)
    .bind(new.sent_at)
    .fetch_one(exec)
    .await
}

pub struct NewBonusLevel<'a> {
    pub project_id: ProjectId,
    pub name: &'a str,
    pub min_amount: Money,
    pub max_amount: Option<Money>,
    pub bonus_percent: rust_decimal::Decimal,
    pub payment_percent: rust_decimal::Decimal,
    pub sort_order: i32,
}

pub async fn insert_level<'e>(exec: impl PgExecutor<'e>, new: NewBonusLevel<'_>) -> Result<BonusLevel, sqlx::Error> {
    sqlx::query_as::<_, BonusLevel>(
        "INSERT INTO bonus_levels (id, project_id, name, min_amount, max_amount, bonus_percent,
                                    payment_percent, sort_order, is_active)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.project_id)
    .bind(new.name)
    .bind(new.min_amount)
    .bind(new.max_amount)
    .bind(new.bonus_percent)
    .bind(new.payment_percent)
    .bind(new.sort_order)
    .fetch_one(exec)
    .await
}

pub async fn upsert_bot_settings<'e>(
    exec: impl PgExecutor<'e>,
    settings: &BotSettings,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO bot_settings (project_id, bot_token, bot_username, is_active, welcome_message,
                                    message_settings, show_balance, show_level, show_referral,
                                    show_history, show_help)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (project_id) DO UPDATE SET
            bot_token = EXCLUDED.bot_token,
            bot_username = EXCLUDED.bot_username,
            is_active = EXCLUDED.is_active,
            welcome_message = EXCLUDED.welcome_message,
            message_settings = EXCLUDED.message_settings,
            show_balance = EXCLUDED.show_balance,
            show_level = EXCLUDED.show_level,
            show_referral = EXCLUDED.show_referral,
            show_history = EXCLUDED.show_history,
            show_help = EXCLUDED.show_help",
    )
    .bind(settings.project_id)
    .bind(&settings.bot_token)
    .bind(&settings.bot_username)
    .bind(settings.is_active)
    .bind(&settings.welcome_message)
    .bind(&settings.message_settings)
    .bind(settings.show_balance)
    .bind(settings.show_level)
    .bind(settings.show_referral)
    .bind(settings.show_history)
    .bind(settings.show_help)
    .execute(exec)
    .await?;
    Ok(())
}
