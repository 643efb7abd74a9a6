//! Core domain types shared across the engines (spec §3).
//!
//! Enums here are persisted as plain `TEXT` columns (see `store::models`),
//! a manual row-mapping style rather than a Postgres native enum type.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque project identifier.
pub type ProjectId = Uuid;
/// Opaque user identifier.
pub type UserId = Uuid;
/// Opaque bonus lot identifier.
pub type BonusLotId = Uuid;
/// Opaque transaction identifier.
pub type TransactionId = Uuid;
/// Opaque bonus level identifier.
pub type LevelId = Uuid;

/// Kind of a [`crate::store::models::BonusLot`] accrual (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BonusType {
    /// Accrued from a storefront purchase.
    Purchase,
    /// Accrued on the user's birthday.
    Birthday,
    /// Accrued by manual admin adjustment.
    Manual,
    /// Accrued as a referral payout to a referrer.
    Referral,
    /// Accrued via a promotional campaign.
    Promo,
}

impl std::fmt::Display for BonusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BonusType::Purchase => "PURCHASE",
            BonusType::Birthday => "BIRTHDAY",
            BonusType::Manual => "MANUAL",
            BonusType::Referral => "REFERRAL",
            BonusType::Promo => "PROMO",
        };
        f.write_str(s)
    }
}

impl FromStr for BonusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PURCHASE" => Ok(BonusType::Purchase),
            "BIRTHDAY" => Ok(BonusType::Birthday),
            "MANUAL" => Ok(BonusType::Manual),
            "REFERRAL" => Ok(BonusType::Referral),
            "PROMO" => Ok(BonusType::Promo),
            other => Err(format!("unknown bonus type: {other}")),
        }
    }
}

/// Kind of ledger [`crate::store::models::Transaction`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    /// A bonus was accrued.
    Earn,
    /// A bonus was consumed.
    Spend,
    /// A bonus lot expired unused.
    Expire,
    /// A manual administrative balance adjustment.
    AdminAdjust,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionType::Earn => "EARN",
            TransactionType::Spend => "SPEND",
            TransactionType::Expire => "EXPIRE",
            TransactionType::AdminAdjust => "ADMIN_ADJUST",
        };
        f.write_str(s)
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EARN" => Ok(TransactionType::Earn),
            "SPEND" => Ok(TransactionType::Spend),
            "EXPIRE" => Ok(TransactionType::Expire),
            "ADMIN_ADJUST" => Ok(TransactionType::AdminAdjust),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// A notification delivery channel (spec §3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Telegram bot delivery — the only live channel.
    Telegram,
    /// Email delivery — stub collaborator.
    Email,
    /// SMS delivery — stub collaborator.
    Sms,
    /// Push notification delivery — stub collaborator.
    Push,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Telegram => "telegram",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        };
        f.write_str(s)
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Channel::Telegram),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "push" => Ok(Channel::Push),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonus_type_roundtrips_through_display_and_parse() {
        for variant in [
            BonusType::Purchase,
            BonusType::Birthday,
            BonusType::Manual,
            BonusType::Referral,
            BonusType::Promo,
        ] {
            let s = variant.to_string();
            assert_eq!(s.parse::<BonusType>().unwrap(), variant);
        }
    }

    #[test]
    fn transaction_type_roundtrips() {
        assert_eq!(
            TransactionType::AdminAdjust.to_string().parse::<TransactionType>().unwrap(),
            TransactionType::AdminAdjust
        );
    }

    #[test]
    fn channel_roundtrips_through_json() {
        let json = serde_json::to_string(&Channel::Telegram).unwrap();
        assert_eq!(json, "\"telegram\"");
    }

    #[test]
    fn unknown_variant_rejected() {
        assert!("BOGUS".parse::<BonusType>().is_err());
    }
}
