//! The persistence layer (spec §3 "Data model", §4.1 "Store").
//!
//! [`Store`] owns the pool and serves every read. Writes that must be
//! atomic (awarding a bonus, spending across several lots, expiring a
//! batch) go through a [`UnitOfWork`], a thin guard over one
//! `sqlx::Transaction` — mirrors the `StateDb::open` + explicit
//! transaction pattern in `flatline::db`, generalized from SQLite to
//! Postgres because the ledger needs `SERIALIZABLE` isolation and
//! SQLSTATE-based conflict retries (spec §4.2 "Concurrency").

pub mod models;
mod queries;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

pub use queries::{NewBonusLevel, NewBonusLot, NewNotificationLog, NewTransaction, NewUser};

use crate::money::Money;
use crate::store::models::{
    BonusLevel, BonusLot, BotSettings, NotificationLog, Project, ReferralProgram,
    Transaction as TransactionRow, User,
};
use crate::types::{BonusLotId, ProjectId, TransactionType, UserId};

const SCHEMA: &str = include_str!("migrations/001_schema.sql");

/// Owns the connection pool and serves read queries directly against it.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to `database_url` and apply the schema migration.
    ///
    /// Mirrors `flatline::db::StateDb::open`: build a pool, then run the
    /// embedded DDL once via `raw_sql`. Every statement is `CREATE ... IF
    /// NOT EXISTS`, so this is safe to call on every startup.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an already-open pool (used by tests against a throwaway database).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start a `SERIALIZABLE` transaction for operations that must be atomic.
    pub async fn begin(&self) -> Result<UnitOfWork<'_>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(UnitOfWork { tx })
    }

    pub async fn find_project_by_webhook_secret(&self, secret: &str) -> Result<Option<Project>, sqlx::Error> {
        queries::find_project_by_webhook_secret(&self.pool, secret).await
    }

    pub async fn find_project(&self, id: ProjectId) -> Result<Option<Project>, sqlx::Error> {
        queries::find_project(&self.pool, id).await
    }

    pub async fn find_user_by_email(&self, project_id: ProjectId, email: &str) -> Result<Option<User>, sqlx::Error> {
        queries::find_user_by_email(&self.pool, project_id, email).await
    }

    pub async fn find_user_by_phone(&self, project_id: ProjectId, phone: &str) -> Result<Option<User>, sqlx::Error> {
        queries::find_user_by_phone(&self.pool, project_id, phone).await
    }

    pub async fn find_user_by_telegram(
        &self,
        project_id: ProjectId,
        telegram_id: i64,
    ) -> Result<Option<User>, sqlx::Error> {
        queries::find_user_by_telegram(&self.pool, project_id, telegram_id).await
    }

    pub async fn find_user(&self, id: UserId) -> Result<Option<User>, sqlx::Error> {
        queries::find_user(&self.pool, id).await
    }

    pub async fn find_user_by_referral_code(
        &self,
        project_id: ProjectId,
        code: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        queries::find_user_by_referral_code(&self.pool, project_id, code).await
    }

    pub async fn list_active_levels(&self, project_id: ProjectId) -> Result<Vec<BonusLevel>, sqlx::Error> {
        queries::list_active_levels(&self.pool, project_id).await
    }

    pub async fn count_levels(&self, project_id: ProjectId) -> Result<i64, sqlx::Error> {
        queries::count_levels(&self.pool, project_id).await
    }

    pub async fn count_referrals(&self, referrer_id: UserId) -> Result<i64, sqlx::Error> {
        queries::count_referrals(&self.pool, referrer_id).await
    }

    pub async fn get_referral_program(&self, project_id: ProjectId) -> Result<Option<ReferralProgram>, sqlx::Error> {
        queries::get_referral_program(&self.pool, project_id).await
    }

    pub async fn get_bot_settings(&self, project_id: ProjectId) -> Result<Option<BotSettings>, sqlx::Error> {
        queries::get_bot_settings(&self.pool, project_id).await
    }

    pub async fn list_active_bot_settings(&self) -> Result<Vec<BotSettings>, sqlx::Error> {
        queries::list_active_bot_settings(&self.pool).await
    }

    pub async fn list_available_lots(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<BonusLot>, sqlx::Error> {
        queries::list_available_lots(&self.pool, user_id, now).await
    }

    pub async fn list_due_lots_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<BonusLot>, sqlx::Error> {
        queries::list_due_lots_for_expiry(&self.pool, now).await
    }

    pub async fn list_expiring_lots(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        horizon: chrono::Duration,
    ) -> Result<Vec<BonusLot>, sqlx::Error> {
        queries::list_expiring_lots(&self.pool, user_id, now, horizon).await
    }

    pub async fn sum_by_type(&self, user_id: UserId, kind: TransactionType) -> Result<Money, sqlx::Error> {
        queries::sum_by_type(&self.pool, user_id, kind).await
    }

    pub async fn find_purchase_earn_by_order(
        &self,
        user_id: UserId,
        order_id: &str,
    ) -> Result<Option<TransactionRow>, sqlx::Error> {
        queries::find_purchase_earn_by_order(&self.pool, user_id, order_id).await
    }

    pub async fn find_spend_marker_by_order(
        &self,
        user_id: UserId,
        order_id: &str,
    ) -> Result<Option<TransactionRow>, sqlx::Error> {
        queries::find_spend_marker_by_order(&self.pool, user_id, order_id).await
    }

    pub async fn list_recent_transactions(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<TransactionRow>, sqlx::Error> {
        queries::list_recent_transactions(&self.pool, user_id, limit).await
    }
}

/// A single `SERIALIZABLE` transaction. Every write used by the ledger,
/// level, and referral engines goes through one of these so a bonus award
/// and its balance update land atomically (Invariant 2).
///
/// Call [`UnitOfWork::commit`] to persist; dropping without committing
/// rolls back (sqlx's default `Transaction` drop behavior).
pub struct UnitOfWork<'c> {
    tx: Transaction<'c, Postgres>,
}

impl<'c> UnitOfWork<'c> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    /// Explicit rollback. Equivalent to dropping `self`, spelled out for
    /// call sites that want to log the reason first.
    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }

    pub async fn find_user(&mut self, id: UserId) -> Result<Option<User>, sqlx::Error> {
        queries::find_user(&mut *self.tx, id).await
    }

    pub async fn find_project(&mut self, id: ProjectId) -> Result<Option<Project>, sqlx::Error> {
        queries::find_project(&mut *self.tx, id).await
    }

    /// Re-read a user row with the transaction's own snapshot, used right
    /// before a balance-affecting write to get a consistent view under
    /// `SERIALIZABLE` (a conflicting concurrent writer causes `commit` to
    /// fail with SQLSTATE 40001, which callers retry — spec §4.2).
    pub async fn find_user_by_telegram(
        &mut self,
        project_id: ProjectId,
        telegram_id: i64,
    ) -> Result<Option<User>, sqlx::Error> {
        queries::find_user_by_telegram(&mut *self.tx, project_id, telegram_id).await
    }

    pub async fn list_available_lots(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<BonusLot>, sqlx::Error> {
        queries::list_available_lots(&mut *self.tx, user_id, now).await
    }

    pub async fn list_due_lots_for_expiry(&mut self, now: DateTime<Utc>) -> Result<Vec<BonusLot>, sqlx::Error> {
        queries::list_due_lots_for_expiry(&mut *self.tx, now).await
    }

    pub async fn find_purchase_earn_by_order(
        &mut self,
        user_id: UserId,
        order_id: &str,
    ) -> Result<Option<TransactionRow>, sqlx::Error> {
        queries::find_purchase_earn_by_order(&mut *self.tx, user_id, order_id).await
    }

    pub async fn find_spend_marker_by_order(
        &mut self,
        user_id: UserId,
        order_id: &str,
    ) -> Result<Option<TransactionRow>, sqlx::Error> {
        queries::find_spend_marker_by_order(&mut *self.tx, user_id, order_id).await
    }

    pub async fn list_active_levels(&mut self, project_id: ProjectId) -> Result<Vec<BonusLevel>, sqlx::Error> {
        queries::list_active_levels(&mut *self.tx, project_id).await
    }

    pub async fn count_levels(&mut self, project_id: ProjectId) -> Result<i64, sqlx::Error> {
        queries::count_levels(&mut *self.tx, project_id).await
    }

    pub async fn get_referral_program(&mut self, project_id: ProjectId) -> Result<Option<ReferralProgram>, sqlx::Error> {
        queries::get_referral_program(&mut *self.tx, project_id).await
    }

    pub async fn create_user(&mut self, new: NewUser<'_>) -> Result<User, sqlx::Error> {
        queries::create_user(&mut *self.tx, new).await
    }

    pub async fn set_referred_by(&mut self, user_id: UserId, referrer_id: UserId) -> Result<(), sqlx::Error> {
        queries::set_referred_by(&mut *self.tx, user_id, referrer_id).await
    }

    pub async fn set_referral_code(&mut self, user_id: UserId, code: &str) -> Result<(), sqlx::Error> {
        queries::set_referral_code(&mut *self.tx, user_id, code).await
    }

    pub async fn link_telegram(
        &mut self,
        user_id: UserId,
        telegram_id: i64,
        username: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        queries::link_telegram(&mut *self.tx, user_id, telegram_id, username).await
    }

    pub async fn update_user_purchase_totals(
        &mut self,
        user_id: UserId,
        new_total: Money,
        level_name: &str,
    ) -> Result<(), sqlx::Error> {
        queries::update_user_purchase_totals(&mut *self.tx, user_id, new_total, level_name).await
    }

    pub async fn insert_bonus_lot(&mut self, new: NewBonusLot<'_>) -> Result<BonusLot, sqlx::Error> {
        queries::insert_bonus_lot(&mut *self.tx, new).await
    }

    pub async fn insert_transaction(&mut self, new: NewTransaction<'_>) -> Result<TransactionRow, sqlx::Error> {
        queries::insert_transaction(&mut *self.tx, new).await
    }

    pub async fn decrement_lot(
        &mut self,
        lot_id: BonusLotId,
        taken: Money,
        force_used: bool,
    ) -> Result<(), sqlx::Error> {
        queries::decrement_lot(&mut *self.tx, lot_id, taken, force_used).await
    }

    pub async fn insert_notification_log(
        &mut self,
        new: NewNotificationLog<'_>,
    ) -> Result<NotificationLog, sqlx::Error> {
        queries::insert_notification_log(&mut *self.tx, new).await
    }

    pub async fn insert_level(&mut self, new: NewBonusLevel<'_>) -> Result<BonusLevel, sqlx::Error> {
        queries::insert_level(&mut *self.tx, new).await
    }

    pub async fn upsert_bot_settings(&mut self, settings: &BotSettings) -> Result<(), sqlx::Error> {
        queries::upsert_bot_settings(&mut *self.tx, settings).await
    }
}

/// `true` when a Postgres error is a serialization failure or deadlock that
/// the caller should retry with a fresh [`UnitOfWork`] (spec §4.2 "Concurrency",
/// SQLSTATE `40001`/`40P01`).
pub fn is_retryable_conflict(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|e| e.code()).as_deref(),
        Some("40001") | Some("40P01")
    )
}
