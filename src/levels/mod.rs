//! Level Engine (C3, spec §4.3): resolves a user's tier from cumulative
//! purchases and reports progress toward the next one.
//!
//! Pure functions over an already-loaded `&[BonusLevel]` slice — callers
//! (the ledger, the bot) fetch the active set from the store once per
//! operation and hand it in, rather than this module owning a cache.

use rust_decimal::Decimal;

use crate::error::{AppError, AppResult};
use crate::money::Money;
use crate::store::models::BonusLevel;
use crate::store::{NewBonusLevel, Store, UnitOfWork};
use crate::types::ProjectId;

/// The tier whose `[minAmount, maxAmount ?? +inf)` contains `total_purchases`,
/// or `None` when no active level matches (caller falls back to the
/// project's base `bonusPercentage`).
pub fn calculate_level(levels: &[BonusLevel], total_purchases: Money) -> Option<&BonusLevel> {
    levels.iter().find(|level| level.contains(total_purchases))
}

/// Progress toward the next tier above the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelProgress<'a> {
    /// The currently-matching level, if any.
    pub current: Option<&'a BonusLevel>,
    /// The active level with the smallest `minAmount` greater than
    /// `total_purchases`, if any.
    pub next: Option<&'a BonusLevel>,
    /// `next.minAmount - total_purchases`, zero when there is no next level.
    pub amount_needed: Money,
    /// Progress within the current bracket, clamped to `[0, 100]`.
    pub progress_percent: Decimal,
}

/// `progressToNext` (spec §4.3).
pub fn progress_to_next(levels: &[BonusLevel], total_purchases: Money) -> LevelProgress<'_> {
    let current = calculate_level(levels, total_purchases);

    let next = levels
        .iter()
        .filter(|level| level.min_amount > total_purchases)
        .min_by_key(|level| level.min_amount);

    let Some(next_level) = next else {
        return LevelProgress {
            current,
            next: None,
            amount_needed: Money::ZERO,
            progress_percent: Decimal::from(100),
        };
    };

    let amount_needed = next_level.min_amount.saturating_sub(total_purchases);

    let progress_percent = match current {
        Some(cur) => {
            let span = next_level.min_amount.as_decimal() - cur.min_amount.as_decimal();
            if span <= Decimal::ZERO {
                Decimal::from(100)
            } else {
                let raw = (total_purchases.as_decimal() - cur.min_amount.as_decimal()) * Decimal::from(100) / span;
                clamp(raw, Decimal::ZERO, Decimal::from(100))
            }
        }
        None => Decimal::ZERO,
    };

    LevelProgress {
        current,
        next: Some(next_level),
        amount_needed,
        progress_percent,
    }
}

fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

/// `createDefaults` (spec §4.3): seed three tiers if the project has none.
/// Idempotent under re-run.
pub async fn create_defaults(store: &Store, project_id: ProjectId) -> AppResult<()> {
    if store.count_levels(project_id).await? > 0 {
        return Ok(());
    }

    let mut uow = store.begin().await?;
    let defaults = [
        ("Серебро", Money::from_i64(0), Some(Money::from_i64(9_999)), Decimal::from(3), Decimal::from(10), 0),
        ("Золото", Money::from_i64(10_000), Some(Money::from_i64(49_999)), Decimal::from(5), Decimal::from(15), 1),
        ("Платина", Money::from_i64(50_000), None, Decimal::from(7), Decimal::from(20), 2),
    ];
    for (name, min_amount, max_amount, bonus_percent, payment_percent, sort_order) in defaults {
        uow.insert_level(NewBonusLevel {
            project_id,
            name,
            min_amount,
            max_amount,
            bonus_percent,
            payment_percent,
            sort_order,
        })
        .await?;
    }
    uow.commit().await?;
    Ok(())
}

/// Reject an overlapping level configuration at write time (spec §4.3
/// "Ties ... are a configuration error").
pub fn validate_no_overlap(existing: &[BonusLevel], candidate: &BonusLevel) -> AppResult<()> {
    for other in existing {
        if other.id == candidate.id {
            continue;
        }
        if ranges_overlap(other, candidate) {
            return Err(AppError::Validation(format!(
                "level '{}' overlaps existing level '{}'",
                candidate.name, other.name
            )));
        }
    }
    Ok(())
}

fn ranges_overlap(a: &BonusLevel, b: &BonusLevel) -> bool {
    let a_hi = a.max_amount.unwrap_or(Money::new(rust_decimal::Decimal::MAX));
    let b_hi = b.max_amount.unwrap_or(Money::new(rust_decimal::Decimal::MAX));
    a.min_amount <= b_hi && b.min_amount <= a_hi
}

/// Insert a validated level inside an existing [`UnitOfWork`], used by admin
/// flows that add a tier to a project with levels already configured.
pub async fn insert_level_checked(
    uow: &mut UnitOfWork<'_>,
    project_id: ProjectId,
    existing: &[BonusLevel],
    new: NewBonusLevel<'_>,
) -> AppResult<BonusLevel> {
    let probe = BonusLevel {
        id: uuid::Uuid::nil(),
        project_id,
        name: new.name.to_string(),
        min_amount: new.min_amount,
        max_amount: new.max_amount,
        bonus_percent: new.bonus_percent,
        payment_percent: new.payment_percent,
        sort_order: new.sort_order,
        is_active: true,
    };
    validate_no_overlap(existing, &probe)?;
    Ok(uow.insert_level(new).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn level(name: &str, min: i64, max: Option<i64>, bonus_pct: i64, order: i32) -> BonusLevel {
        BonusLevel {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: name.to_string(),
            min_amount: Money::from_i64(min),
            max_amount: max.map(Money::from_i64),
            bonus_percent: Decimal::from(bonus_pct),
            payment_percent: Decimal::from(bonus_pct * 2),
            sort_order: order,
            is_active: true,
        }
    }

    #[test]
    fn calculate_level_picks_matching_bracket() {
        let levels = vec![level("Base", 0, Some(999), 3, 0), level("Silver", 1000, None, 7, 1)];
        let found = calculate_level(&levels, Money::from_i64(1500)).unwrap();
        assert_eq!(found.name, "Silver");
    }

    #[test]
    fn calculate_level_none_when_no_bracket_matches() {
        let levels = vec![level("Mid", 1000, Some(2000), 5, 0)];
        assert!(calculate_level(&levels, Money::from_i64(500)).is_none());
    }

    #[test]
    fn calculate_level_is_deterministic_and_monotone() {
        let levels = vec![level("Base", 0, Some(999), 3, 0), level("Silver", 1000, None, 7, 1)];
        let a = calculate_level(&levels, Money::from_i64(1500)).map(|l| l.bonus_percent);
        let b = calculate_level(&levels, Money::from_i64(1500)).map(|l| l.bonus_percent);
        assert_eq!(a, b);
        let lower = calculate_level(&levels, Money::from_i64(500)).map(|l| l.bonus_percent);
        assert!(lower <= a);
    }

    #[test]
    fn progress_to_next_reports_needed_amount_and_percent() {
        let levels = vec![level("Base", 0, Some(999), 3, 0), level("Silver", 1000, None, 7, 1)];
        let progress = progress_to_next(&levels, Money::from_i64(500));
        assert_eq!(progress.current.unwrap().name, "Base");
        assert_eq!(progress.next.unwrap().name, "Silver");
        assert_eq!(progress.amount_needed.to_string(), "500.00");
        assert_eq!(progress.progress_percent, Decimal::from(50));
    }

    #[test]
    fn progress_to_next_caps_at_hundred_with_no_further_level() {
        let levels = vec![level("Top", 0, None, 10, 0)];
        let progress = progress_to_next(&levels, Money::from_i64(5000));
        assert!(progress.next.is_none());
        assert_eq!(progress.progress_percent, Decimal::from(100));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let existing = vec![level("A", 0, Some(999), 3, 0)];
        let candidate = level("B", 500, Some(1500), 5, 1);
        assert!(validate_no_overlap(&existing, &candidate).is_err());
    }

    #[test]
    fn disjoint_ranges_are_accepted() {
        let existing = vec![level("A", 0, Some(999), 3, 0)];
        let candidate = level("B", 1000, None, 5, 1);
        assert!(validate_no_overlap(&existing, &candidate).is_ok());
    }
}
