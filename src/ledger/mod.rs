//! Bonus Ledger & Transactional Accrual/Spend Engine (C2, spec §4.2).
//!
//! The append-only bookkeeping of bonuses: FIFO consumption by expiry,
//! level recomputation, referral payout, and at-most-once semantics per
//! external order id, all executed inside one `SERIALIZABLE`
//! [`UnitOfWork`] per operation. Write conflicts are retried with
//! exponential backoff at the transaction boundary (spec §4.2 "Failure
//! semantics"), the same bounded-retry shape used around other
//! serialized-transaction writes in this codebase.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::levels;
use crate::money::Money;
use crate::referral::{self, ReferralPayoutOutcome};
use crate::store::models::{BonusLot, Transaction};
use crate::store::{self, NewBonusLot, NewTransaction, Store, UnitOfWork};
use crate::types::{BonusType, ProjectId, TransactionType, UserId};

/// Injected collaborator for the fire-and-forget notification side-effect
/// of [`LedgerEngine::award`]. The notification service implements this;
/// the ledger only depends on the shape it needs (spec §9 "Process-wide
/// singletons ... one explicit composition root").
pub trait BonusAwardNotifier: Send + Sync {
    /// Notify `user_id` that `amount` was just accrued. Must not block the
    /// caller for long and must never propagate an error to it — any
    /// failure is the notifier's own concern to log and swallow.
    fn notify<'a>(
        &'a self,
        project_id: ProjectId,
        user_id: UserId,
        amount: Money,
        description: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// A notifier that does nothing, used where no notification collaborator
/// is wired (tests, offline tooling).
pub struct NullNotifier;

impl BonusAwardNotifier for NullNotifier {
    fn notify<'a>(
        &'a self,
        _project_id: ProjectId,
        _user_id: UserId,
        _amount: Money,
        _description: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 20;

/// Result of [`LedgerEngine::award_purchase`].
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseAccrual {
    /// The bonus lot created (or the pre-existing one on idempotency hit).
    pub bonus: Option<BonusLot>,
    /// The EARN transaction written (or the pre-existing one on idempotency hit).
    pub transaction: Transaction,
    /// The level name in effect after this purchase.
    pub level_name: String,
    /// `true` when this call was a no-op replay of an already-processed order.
    pub idempotent_replay: bool,
    /// Outcome of the referral payout attempt, if one was attempted.
    pub referral: Option<ReferralPayoutOutcome>,
}

/// Balance summary returned by [`LedgerEngine::get_balance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    /// Lifetime sum of EARN transactions.
    pub total_earned: Money,
    /// Lifetime sum of SPEND transactions.
    pub total_spent: Money,
    /// `total_earned - total_spent - total_expired`, always `>= 0` (Invariant 1).
    pub current_balance: Money,
    /// Sum of non-expired, unused lots expiring within the next 30 days.
    pub expiring_soon: Money,
}

/// The ledger engine. Cloning is cheap: `Store` wraps a connection pool and
/// `notifier` is behind an `Arc`.
#[derive(Clone)]
pub struct LedgerEngine {
    store: Store,
    notifier: Arc<dyn BonusAwardNotifier>,
}

impl LedgerEngine {
    /// Build a ledger engine over `store`, using `notifier` for the
    /// fire-and-forget award notification.
    pub fn new(store: Store, notifier: Arc<dyn BonusAwardNotifier>) -> Self {
        Self { store, notifier }
    }

    /// `award` (spec §4.2).
    pub async fn award(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        amount: Money,
        bonus_type: BonusType,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
        is_referral_bonus: bool,
    ) -> AppResult<BonusLot> {
        let lot = with_retry(|| async {
            let mut uow = self.store.begin().await?;
            let lot = award_in_transaction(
                &mut uow,
                user_id,
                amount,
                bonus_type,
                description,
                expires_at,
                is_referral_bonus,
            )
            .await?;
            uow.commit().await?;
            Ok(lot)
        })
        .await?;

        let notifier = Arc::clone(&self.notifier);
        let description = description.to_string();
        tokio::spawn(async move {
            notifier.notify(project_id, user_id, amount, &description).await;
        });

        Ok(lot)
    }

    /// `awardPurchase` (spec §4.2).
    pub async fn award_purchase(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        purchase_amount: Money,
        order_id: &str,
        description: &str,
    ) -> AppResult<PurchaseAccrual> {
        if let Some(existing) = self.store.find_purchase_earn_by_order(user_id, order_id).await? {
            let user = self.required_user(user_id).await?;
            return Ok(PurchaseAccrual {
                bonus: None,
                transaction: existing,
                level_name: user.current_level_name,
                idempotent_replay: true,
                referral: None,
            });
        }

        let result = with_retry(|| async {
            let mut uow = self.store.begin().await?;

            if let Some(existing) = uow.find_purchase_earn_by_order(user_id, order_id).await? {
                let user = uow
                    .find_user(user_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
                uow.commit().await?;
                return Ok(PurchaseAccrual {
                    bonus: None,
                    transaction: existing,
                    level_name: user.current_level_name,
                    idempotent_replay: true,
                    referral: None,
                });
            }

            let project = self
                .store
                .find_project(project_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("project {project_id}")))?;
            let user = uow
                .find_user(user_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;

            let new_total = user.total_purchases + purchase_amount;
            let levels = uow.list_active_levels(project_id).await?;

            // The rate applied is the rate at the time of the call: a purchase
            // that newly crosses a tier boundary is still charged at the rate
            // in force before this purchase (spec §8 scenario 2). Only the
            // stored level name advances to `new_total`'s tier, so the next
            // call sees the updated rate.
            let applied_level = levels::calculate_level(&levels, user.total_purchases);
            let bonus_percent = applied_level.map(|l| l.bonus_percent).unwrap_or(project.bonus_percentage);

            let matched_level = levels::calculate_level(&levels, new_total);
            let level_name = matched_level.map(|l| l.name.clone()).unwrap_or_else(|| "Base".to_string());

            uow.update_user_purchase_totals(user_id, new_total, &level_name).await?;

            let bonus_amount = purchase_amount.percent_of(bonus_percent);

            // A zero bonus still writes the EARN marker transaction (no lot)
            // so the purchase-order idempotency index covers it: without it,
            // a replay of the same orderId on a zero-bonus purchase would
            // re-apply totalPurchases, violating the idempotency invariant.
            let (bonus, transaction) = if bonus_amount.is_zero() {
                let transaction = uow
                    .insert_transaction(NewTransaction {
                        user_id,
                        bonus_id: None,
                        transaction_type: "EARN",
                        amount: bonus_amount,
                        description,
                        order_id: Some(order_id),
                        bonus_type: Some("PURCHASE"),
                        spend_order_id: None,
                        user_level: Some(&level_name),
                        applied_percent: Some(bonus_percent),
                        is_referral_bonus: false,
                    })
                    .await?;
                (None, transaction)
            } else {
                let expires_at = Utc::now() + chrono::Duration::days(i64::from(project.bonus_expiry_days));
                let lot = uow
                    .insert_bonus_lot(NewBonusLot {
                        user_id,
                        amount: bonus_amount,
                        bonus_type: "PURCHASE",
                        description,
                        expires_at: Some(expires_at),
                    })
                    .await?;
                let transaction = uow
                    .insert_transaction(NewTransaction {
                        user_id,
                        bonus_id: Some(lot.id),
                        transaction_type: "EARN",
                        amount: bonus_amount,
                        description,
                        order_id: Some(order_id),
                        bonus_type: Some("PURCHASE"),
                        spend_order_id: None,
                        user_level: Some(&level_name),
                        applied_percent: Some(bonus_percent),
                        is_referral_bonus: false,
                    })
                    .await?;
                (Some(lot), transaction)
            };

            let referred_user = uow
                .find_user(user_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
            let referral = referral::pay_on_purchase(&mut uow, project_id, &referred_user, purchase_amount)
                .await
                .unwrap_or(ReferralPayoutOutcome::NoPayout);

            uow.commit().await?;

            Ok(PurchaseAccrual {
                bonus,
                transaction,
                level_name,
                idempotent_replay: false,
                referral: Some(referral),
            })
        })
        .await?;

        if !result.idempotent_replay {
            let notifier = Arc::clone(&self.notifier);
            let description = description.to_string();
            let bonus_amount = result.transaction.amount;
            tokio::spawn(async move {
                notifier.notify(project_id, user_id, bonus_amount, &description).await;
            });
        }

        Ok(result)
    }

    /// `spend` (spec §4.2). Fails with [`AppError::InsufficientBonuses`]
    /// without writing anything when the available balance is short.
    pub async fn spend(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        spend_order_id: Option<&str>,
    ) -> AppResult<Vec<Transaction>> {
        if let Some(order_id) = spend_order_id {
            if let Some(existing) = self.store.find_spend_marker_by_order(user_id, order_id).await? {
                return Ok(vec![existing]);
            }
        }

        with_retry(|| async {
            let mut uow = self.store.begin().await?;

            if let Some(order_id) = spend_order_id {
                if let Some(existing) = uow.find_spend_marker_by_order(user_id, order_id).await? {
                    uow.commit().await?;
                    return Ok(vec![existing]);
                }
            }

            let now = Utc::now();
            let lots = uow.list_available_lots(user_id, now).await?;
            let available: Money = lots.iter().map(|l| l.amount).sum();
            if available < amount {
                return Err(AppError::InsufficientBonuses);
            }

            let user = uow
                .find_user(user_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
            let levels = uow.list_active_levels(user.project_id).await?;
            let current_level = levels::calculate_level(&levels, user.total_purchases);
            let level_name = current_level.map(|l| l.name.clone());
            let applied_percent = current_level.map(|l| l.payment_percent);

            let mut remaining = amount;
            let mut written = Vec::new();
            for lot in lots {
                if remaining.is_zero() {
                    break;
                }
                let take = lot.amount.min(remaining);
                remaining = remaining.saturating_sub(take);
                let fully_consumed = take == lot.amount;

                uow.decrement_lot(lot.id, take, fully_consumed).await?;

                let transaction = uow
                    .insert_transaction(NewTransaction {
                        user_id,
                        bonus_id: Some(lot.id),
                        transaction_type: "SPEND",
                        amount: take,
                        description,
                        order_id: None,
                        bonus_type: None,
                        spend_order_id,
                        user_level: level_name.as_deref(),
                        applied_percent,
                        is_referral_bonus: false,
                    })
                    .await?;
                written.push(transaction);
            }

            uow.commit().await?;
            Ok(written)
        })
        .await
    }

    /// `expireDueLots` (spec §4.2), run by a scheduled task. Idempotent
    /// under re-run: a lot already marked used is never revisited because
    /// the query only selects `is_used = false`.
    pub async fn expire_due_lots(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let due = self.store.list_due_lots_for_expiry(now).await?;
        let mut expired = 0usize;
        for lot in due {
            let outcome = with_retry(|| async {
                let mut uow = self.store.begin().await?;
                uow.decrement_lot(lot.id, lot.amount, true).await?;
                uow.insert_transaction(NewTransaction {
                    user_id: lot.user_id,
                    bonus_id: Some(lot.id),
                    transaction_type: "EXPIRE",
                    amount: lot.amount,
                    description: "Bonus lot expired",
                    order_id: None,
                    bonus_type: None,
                    spend_order_id: None,
                    user_level: None,
                    applied_percent: None,
                    is_referral_bonus: false,
                })
                .await?;
                uow.commit().await?;
                Ok(())
            })
            .await;

            match outcome {
                Ok(()) => expired += 1,
                Err(err) => tracing::warn!(lot_id = %lot.id, error = %err, "failed to expire bonus lot"),
            }
        }
        Ok(expired)
    }

    /// `getBalance` (spec §4.2).
    pub async fn get_balance(&self, user_id: UserId) -> AppResult<Balance> {
        let total_earned = self.store.sum_by_type(user_id, TransactionType::Earn).await?;
        let total_spent = self.store.sum_by_type(user_id, TransactionType::Spend).await?;
        let total_expired = self.store.sum_by_type(user_id, TransactionType::Expire).await?;
        let current_balance = total_earned.saturating_sub(total_spent).saturating_sub(total_expired);

        let now = Utc::now();
        let expiring = self
            .store
            .list_expiring_lots(user_id, now, chrono::Duration::days(30))
            .await?;
        let expiring_soon: Money = expiring.iter().map(|l| l.amount).sum();

        Ok(Balance {
            total_earned,
            total_spent,
            current_balance,
            expiring_soon,
        })
    }

    async fn required_user(&self, user_id: UserId) -> AppResult<crate::store::models::User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }
}

/// Insert a BonusLot plus its single accompanying EARN Transaction inside
/// an already-open [`UnitOfWork`] (spec §9 Open Question 2: exactly one
/// EARN per award, written here and nowhere else).
pub async fn award_in_transaction(
    uow: &mut UnitOfWork<'_>,
    user_id: UserId,
    amount: Money,
    bonus_type: BonusType,
    description: &str,
    expires_at: Option<DateTime<Utc>>,
    is_referral_bonus: bool,
) -> AppResult<BonusLot> {
    let user = uow
        .find_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;

    let expires_at = match expires_at {
        Some(ts) => Some(ts),
        None => {
            let project = uow
                .find_project(user.project_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("project {}", user.project_id)))?;
            Some(Utc::now() + chrono::Duration::days(i64::from(project.bonus_expiry_days)))
        }
    };

    let bonus_type_str = bonus_type.to_string();
    let lot = uow
        .insert_bonus_lot(NewBonusLot {
            user_id,
            amount,
            bonus_type: &bonus_type_str,
            description,
            expires_at,
        })
        .await?;

    uow.insert_transaction(NewTransaction {
        user_id,
        bonus_id: Some(lot.id),
        transaction_type: "EARN",
        amount,
        description,
        order_id: None,
        bonus_type: Some(&bonus_type_str),
        spend_order_id: None,
        user_level: None,
        applied_percent: None,
        is_referral_bonus,
    })
    .await?;

    Ok(lot)
}

/// Retry a unit-of-work closure on retryable write conflicts (SQLSTATE
/// `40001`/`40P01`) with exponential backoff, up to [`MAX_RETRIES`] times
/// (spec §4.2 "Failure semantics").
async fn with_retry<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(AppError::Store(ref db_err)) if store::is_retryable_conflict(db_err) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_notifier_does_not_panic() {
        let notifier = NullNotifier;
        let project_id = uuid::Uuid::new_v4();
        let user_id = uuid::Uuid::new_v4();
        let fut = notifier.notify(project_id, user_id, Money::from_i64(10), "test");
        drop(fut);
    }
}
