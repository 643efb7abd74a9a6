//! Multi-tenant loyalty/bonus engine: accrual/spend ledger, tiered levels,
//! referrals, a per-project Telegram bot supervisor, and the storefront
//! webhook ingress that ties them together.

pub mod bot;
pub mod config;
pub mod error;
pub mod ledger;
pub mod levels;
pub mod logging;
pub mod money;
pub mod notification;
pub mod referral;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod webhook;
