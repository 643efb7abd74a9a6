//! Referral Engine (C4, spec §4.4): binds referrer to referee at signup and
//! pays the referrer a percentage of the referee's purchase.
//!
//! The only supported lookup for a new signup is `utm_ref == <referrer
//! user id>`; no legacy referral-code or `utmSource` path is supported.

use url::Url;

use crate::error::AppResult;
use crate::ledger;
use crate::money::Money;
use crate::store::models::User;
use crate::store::{Store, UnitOfWork};
use crate::types::{ProjectId, UserId};

/// Outcome of [`bind_on_register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// `referredBy` was set to the referrer found via `utmRef`.
    Bound(UserId),
    /// No binding happened — missing/self/foreign-project/already-bound.
    NotBound,
}

/// `bindOnRegister` (spec §4.4).
///
/// `utm_ref` is the raw referrer's user id, per the binding Open Question
/// decision. No-ops when the referrer can't be resolved, is the user
/// itself, belongs to a different project, or the user already has a
/// referrer.
pub async fn bind_on_register(
    uow: &mut UnitOfWork<'_>,
    project_id: ProjectId,
    user: &User,
    utm_ref: Option<&str>,
) -> AppResult<BindOutcome> {
    if user.referred_by.is_some() {
        return Ok(BindOutcome::NotBound);
    }
    let Some(raw) = utm_ref else {
        return Ok(BindOutcome::NotBound);
    };
    let Ok(referrer_id) = raw.parse::<UserId>() else {
        return Ok(BindOutcome::NotBound);
    };
    if referrer_id == user.id {
        return Ok(BindOutcome::NotBound);
    }

    let Some(referrer) = uow.find_user(referrer_id).await? else {
        return Ok(BindOutcome::NotBound);
    };
    if referrer.project_id != project_id {
        return Ok(BindOutcome::NotBound);
    }

    uow.set_referred_by(user.id, referrer_id).await?;
    Ok(BindOutcome::Bound(referrer_id))
}

/// Outcome of [`pay_on_purchase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralPayoutOutcome {
    /// The referrer was paid this much.
    Paid(Money),
    /// Nothing was paid — program inactive, non-positive amount, or no
    /// live referrer.
    NoPayout,
}

/// `payOnPurchase` (spec §4.4). Runs entirely within the caller's ledger
/// transaction; failures here must never roll back the primary accrual
/// (spec §4.2), so callers should treat any error as "log and continue".
pub async fn pay_on_purchase(
    uow: &mut UnitOfWork<'_>,
    project_id: ProjectId,
    user: &User,
    purchase_amount: Money,
) -> AppResult<ReferralPayoutOutcome> {
    if purchase_amount.as_decimal() <= rust_decimal::Decimal::ZERO {
        return Ok(ReferralPayoutOutcome::NoPayout);
    }
    let Some(referrer_id) = user.referred_by else {
        return Ok(ReferralPayoutOutcome::NoPayout);
    };
    let Some(program) = uow.get_referral_program(project_id).await? else {
        return Ok(ReferralPayoutOutcome::NoPayout);
    };
    if !program.is_active {
        return Ok(ReferralPayoutOutcome::NoPayout);
    }
    let Some(referrer) = uow.find_user(referrer_id).await? else {
        return Ok(ReferralPayoutOutcome::NoPayout);
    };
    if !referrer.is_active || referrer.project_id != project_id {
        return Ok(ReferralPayoutOutcome::NoPayout);
    }

    let bonus_amount = purchase_amount.percent_of(program.referrer_bonus_percent);
    if bonus_amount.is_zero() {
        return Ok(ReferralPayoutOutcome::NoPayout);
    }

    let description = format!("Referral bonus for purchase by {}", display_name(user));
    ledger::award_in_transaction(
        uow,
        referrer_id,
        bonus_amount,
        crate::types::BonusType::Referral,
        &description,
        None,
        true,
    )
    .await?;

    Ok(ReferralPayoutOutcome::Paid(bonus_amount))
}

fn display_name(user: &User) -> String {
    match (&user.first_name, &user.last_name) {
        (Some(first), Some(last)) => format!("{first} {last}"),
        (Some(first), None) => first.clone(),
        _ => user.id.to_string(),
    }
}

/// `ensureUserReferralCode` (spec §4.4): returns the user's existing code,
/// or deterministically derives and persists a new one.
pub async fn ensure_user_referral_code(store: &Store, user_id: UserId) -> AppResult<String> {
    let user = store
        .find_user(user_id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound(format!("user {user_id}")))?;

    if let Some(code) = user.referral_code {
        return Ok(code);
    }

    let code = derive_code(user_id);
    let mut uow = store.begin().await?;
    uow.set_referral_code(user_id, &code).await?;
    uow.commit().await?;
    Ok(code)
}

/// Derive a short opaque code deterministically from a user id, so the same
/// user always gets the same code even if the write races (the unique
/// partial index on `users.referral_code` makes a second insert a no-op
/// update under the `WHERE referral_code IS NULL` guard).
fn derive_code(user_id: UserId) -> String {
    user_id.simple().to_string()[..8].to_uppercase()
}

/// `generateLink` (spec §4.4): builds an invite URL with `utm_ref=<userId>`
/// plus any extra query parameters.
pub fn generate_link(user_id: UserId, base_url: &str, extra: &[(&str, &str)]) -> AppResult<String> {
    let mut url = Url::parse(base_url)
        .map_err(|e| crate::error::AppError::Validation(format!("invalid base url: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("utm_ref", &user_id.to_string());
        for (key, value) in extra {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn derive_code_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(derive_code(id), derive_code(id));
        assert_eq!(derive_code(id).len(), 8);
    }

    #[test]
    fn generate_link_includes_utm_ref() {
        let id = Uuid::new_v4();
        let link = generate_link(id, "https://shop.example.com/invite", &[]).unwrap();
        assert!(link.contains(&format!("utm_ref={id}")));
    }

    #[test]
    fn generate_link_includes_extra_params() {
        let id = Uuid::new_v4();
        let link = generate_link(id, "https://shop.example.com/invite", &[("src", "tg")]).unwrap();
        assert!(link.contains("src=tg"));
    }

    #[test]
    fn generate_link_rejects_invalid_base() {
        assert!(generate_link(Uuid::new_v4(), "not a url", &[]).is_err());
    }
}
