//! Row types for the eight entities of the data model (spec §3).
//!
//! Every row derives [`sqlx::FromRow`] for direct query mapping and
//! `serde` so the webhook/bot layers can echo rows back as JSON without a
//! second mapping layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::money::Money;
use crate::types::{BonusLotId, BonusType, Channel, LevelId, ProjectId, TransactionId, TransactionType, UserId};

/// Tenant root (spec §3 "Project").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    /// Primary key.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Optional storefront domain.
    pub domain: Option<String>,
    /// Unique opaque secret used to authenticate inbound webhooks.
    pub webhook_secret: String,
    /// Base accrual percentage applied when no level matches (0..=100).
    pub bonus_percentage: rust_decimal::Decimal,
    /// Days until a freshly-accrued bonus lot expires (1..=3650).
    pub bonus_expiry_days: i32,
    /// Whether the project currently accepts webhook traffic.
    pub is_active: bool,
}

/// An end-user of a project (spec §3 "User").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Primary key.
    pub id: UserId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Contact email, unique within a project when present.
    pub email: Option<String>,
    /// Contact phone, unique within a project when present.
    pub phone: Option<String>,
    /// First name, if known.
    pub first_name: Option<String>,
    /// Last name, if known.
    pub last_name: Option<String>,
    /// Linked Telegram account id, unique within a project when present.
    pub telegram_id: Option<i64>,
    /// Linked Telegram username, if known.
    pub telegram_username: Option<String>,
    /// Cumulative lifetime purchase amount, drives level computation.
    pub total_purchases: Money,
    /// Name of the currently-applicable [`BonusLevel`].
    pub current_level_name: String,
    /// UTM source recorded at first contact.
    pub utm_source: Option<String>,
    /// This user's own referral code, unique within a project.
    pub referral_code: Option<String>,
    /// The user who referred this user, if any. Set at most once.
    pub referred_by: Option<UserId>,
    /// Whether the user is active.
    pub is_active: bool,
}

impl User {
    /// `true` when at least one contact channel is present, per spec §3's
    /// "must carry at least one of email/phone" invariant.
    pub fn has_contact(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }
}

/// A dated, FIFO-consumable accrual batch (spec §3 "BonusLot").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BonusLot {
    /// Primary key.
    pub id: BonusLotId,
    /// Owning user.
    pub user_id: UserId,
    /// Remaining amount in this lot.
    pub amount: Money,
    /// Accrual type.
    pub bonus_type: String,
    /// Free-text description.
    pub description: String,
    /// When the lot was created.
    pub created_at: DateTime<Utc>,
    /// When the lot expires, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// `true` once the lot's remaining amount has reached zero (spend) or
    /// it has fully expired.
    pub is_used: bool,
}

impl BonusLot {
    /// The accrual type, parsed from the stored text column.
    pub fn kind(&self) -> BonusType {
        self.bonus_type.parse().unwrap_or(BonusType::Manual)
    }

    /// `true` when the lot is currently spendable: unused and not expired.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// An append-only money movement (spec §3 "Transaction").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    /// Primary key.
    pub id: TransactionId,
    /// Owning user.
    pub user_id: UserId,
    /// Bonus lot this transaction moved money against, if any.
    pub bonus_id: Option<BonusLotId>,
    /// Movement type.
    pub transaction_type: String,
    /// Amount moved (always positive; direction is implied by `transaction_type`).
    pub amount: Money,
    /// Free-text description.
    pub description: String,
    /// When the transaction was recorded.
    pub created_at: DateTime<Utc>,
    /// Opaque key/value metadata (e.g. `orderId`).
    pub metadata: JsonValue,
    /// The user's level at the time of this transaction, if applicable.
    pub user_level: Option<String>,
    /// The accrual/spend percent applied, if applicable.
    pub applied_percent: Option<rust_decimal::Decimal>,
    /// `true` when this transaction is a referral payout.
    pub is_referral_bonus: bool,
}

impl Transaction {
    /// The movement type, parsed from the stored text column.
    pub fn kind(&self) -> TransactionType {
        self.transaction_type.parse().unwrap_or(TransactionType::AdminAdjust)
    }

    /// The `orderId` recorded in `metadata`, if present.
    pub fn order_id(&self) -> Option<&str> {
        self.metadata.get("orderId").and_then(|v| v.as_str())
    }
}

/// A project-defined purchase-total tier (spec §3 "BonusLevel").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BonusLevel {
    /// Primary key.
    pub id: LevelId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Display name (e.g. "Silver").
    pub name: String,
    /// Inclusive lower bound of cumulative purchases for this tier.
    pub min_amount: Money,
    /// Inclusive upper bound, or unbounded when `None`.
    pub max_amount: Option<Money>,
    /// Accrual percentage granted at this tier (0..=100).
    pub bonus_percent: rust_decimal::Decimal,
    /// Fraction of an order payable with bonuses at this tier (0..=100).
    pub payment_percent: rust_decimal::Decimal,
    /// Ascending sort/priority order; a strict total order on the active set.
    pub sort_order: i32,
    /// Whether the tier currently participates in level resolution.
    pub is_active: bool,
}

impl BonusLevel {
    /// `true` when `total_purchases` falls within this tier's range.
    pub fn contains(&self, total_purchases: Money) -> bool {
        total_purchases >= self.min_amount
            && self.max_amount.map(|max| total_purchases <= max).unwrap_or(true)
    }
}

/// At most one per project (spec §3 "ReferralProgram").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralProgram {
    /// Owning project (unique).
    pub project_id: ProjectId,
    /// Whether referral payouts are currently enabled.
    pub is_active: bool,
    /// Percentage of the referee's purchase paid to the referrer.
    pub referrer_bonus_percent: rust_decimal::Decimal,
    /// Percentage bonus granted to the referee (not yet disbursed by this engine;
    /// reserved for storefront-side application per spec §4.4 scope).
    pub referee_bonus_percent: rust_decimal::Decimal,
    /// Optional human-readable terms shown to users.
    pub description: Option<String>,
}

/// Per-project Telegram bot configuration (spec §3 "BotSettings").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BotSettings {
    /// Owning project (unique).
    pub project_id: ProjectId,
    /// Telegram bot token.
    pub bot_token: String,
    /// Bot's `@username`, if known.
    pub bot_username: Option<String>,
    /// Whether the supervisor should keep this bot running.
    pub is_active: bool,
    /// Text shown on `/start` for unregistered users.
    pub welcome_message: String,
    /// Opaque per-project message copy overrides.
    pub message_settings: JsonValue,
    /// Which commands this bot exposes.
    pub show_balance: bool,
    /// Whether `/level` is enabled.
    pub show_level: bool,
    /// Whether `/referral` is enabled.
    pub show_referral: bool,
    /// Whether `/history` is enabled.
    pub show_history: bool,
    /// Whether `/help` is enabled.
    pub show_help: bool,
}

/// An append-only record of an attempted notification send (spec §3 "NotificationLog").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationLog {
    /// Primary key.
    pub id: uuid::Uuid,
    /// Owning project.
    pub project_id: ProjectId,
    /// Target user, if the notification was addressed to one.
    pub user_id: Option<UserId>,
    /// Delivery channel.
    pub channel: String,
    /// Notification title/subject.
    pub title: String,
    /// Notification body.
    pub message: String,
    /// Opaque metadata (e.g. `imageUrl`, `buttons`).
    pub metadata: JsonValue,
    /// When the send succeeded, if it did.
    pub sent_at: Option<DateTime<Utc>>,
    /// When this log row was created.
    pub created_at: DateTime<Utc>,
}

impl NotificationLog {
    /// The channel, parsed from the stored text column.
    pub fn channel_kind(&self) -> Option<Channel> {
        self.channel.parse().ok()
    }
}
