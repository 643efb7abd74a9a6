//! Notification Service (C8, spec §4.8): a channel-agnostic dispatcher.
//!
//! Only the Telegram channel is live; email/sms/push are stub
//! collaborators per spec §1's explicit out-of-scope list. Every send
//! attempt — success or failure — is persisted as one [`NotificationLog`]
//! row, following the one-interface-several-swappable-implementations
//! shape used for the other pluggable collaborators in this codebase.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};

use crate::error::{AppError, AppResult};
use crate::ledger::BonusAwardNotifier;
use crate::money::Money;
use crate::store::models::{NotificationLog, User};
use crate::store::{NewNotificationLog, Store};
use crate::types::{Channel, ProjectId, UserId};

/// One delivery channel. Implementations never propagate a send failure as
/// a panic; they return it so the dispatcher can log it and keep going.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Which [`Channel`] this implementation serves.
    fn channel(&self) -> Channel;

    /// Attempt delivery to `user`. `Ok(())` means accepted for delivery by
    /// the collaborator, not necessarily read.
    async fn send(&self, user: &User, title: &str, message: &str) -> AppResult<()>;
}

/// Stub collaborator; spec §1 lists the email channel as out of scope.
pub struct EmailChannel;

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, _user: &User, _title: &str, _message: &str) -> AppResult<()> {
        Err(AppError::ExternalDependency("email channel is not implemented".to_string()))
    }
}

/// Stub collaborator; spec §1 lists the SMS channel as out of scope.
pub struct SmsChannel;

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, _user: &User, _title: &str, _message: &str) -> AppResult<()> {
        Err(AppError::ExternalDependency("sms channel is not implemented".to_string()))
    }
}

/// Stub collaborator; spec §1 lists the push channel as out of scope.
pub struct PushChannel;

#[async_trait]
impl NotificationChannel for PushChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, _user: &User, _title: &str, _message: &str) -> AppResult<()> {
        Err(AppError::ExternalDependency("push channel is not implemented".to_string()))
    }
}

/// Best-effort default policy (spec §4.8 item 1): only Telegram enabled,
/// quiet hours 22:00–08:00, per-user caps 10/day and 3/hour. Advisory
/// only — nothing in this crate enforces it as a hard gate yet, since no
/// settings store for it exists.
#[derive(Debug, Clone, Copy)]
pub struct NotificationPolicy {
    /// Quiet hours start (local service time), inclusive.
    pub quiet_hours_start: NaiveTime,
    /// Quiet hours end (local service time), exclusive.
    pub quiet_hours_end: NaiveTime,
    /// Soft cap on sends per user per day.
    pub per_day_cap: u32,
    /// Soft cap on sends per user per hour.
    pub per_hour_cap: u32,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            quiet_hours_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            quiet_hours_end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            per_day_cap: 10,
            per_hour_cap: 3,
        }
    }
}

impl NotificationPolicy {
    /// `true` when `now` falls inside the configured quiet window. Advisory
    /// only — callers may choose to send anyway.
    pub fn is_quiet_hour(&self, now: chrono::DateTime<Utc>) -> bool {
        let t = now.time();
        if self.quiet_hours_start <= self.quiet_hours_end {
            t >= self.quiet_hours_start && t < self.quiet_hours_end
        } else {
            t >= self.quiet_hours_start || t < self.quiet_hours_end
        }
    }
}

/// Outcome of a multi-channel dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Channels that accepted delivery.
    pub sent: Vec<Channel>,
    /// Channels that failed, with the reason.
    pub failed: Vec<(Channel, String)>,
}

/// The notification service: resolves channels, sends, and logs.
#[derive(Clone)]
pub struct NotificationService {
    store: Store,
    channels: Arc<HashMap<Channel, Arc<dyn NotificationChannel>>>,
    policy: NotificationPolicy,
}

impl NotificationService {
    /// Build a service over the given channel implementations, keyed by
    /// the [`Channel`] each serves.
    pub fn new(store: Store, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        let mut map = HashMap::new();
        for channel in channels {
            map.insert(channel.channel(), channel);
        }
        Self {
            store,
            channels: Arc::new(map),
            policy: NotificationPolicy::default(),
        }
    }

    /// `{{var}}` placeholder substitution (spec §4.8 "Templates").
    pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    if let Some(value) = vars.get(key) {
                        out.push_str(value);
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Dispatch to `requested_channels` (or every registered channel when
    /// `None`), logging one [`NotificationLog`] row per channel regardless
    /// of outcome (spec §4.8 item 3).
    pub async fn dispatch(
        &self,
        project_id: ProjectId,
        user: &User,
        title: &str,
        message: &str,
        metadata: serde_json::Value,
        requested_channels: Option<&[Channel]>,
    ) -> AppResult<DispatchReport> {
        let targets: Vec<Channel> = match requested_channels {
            Some(list) => list.to_vec(),
            None => self.channels.keys().copied().collect(),
        };

        let mut report = DispatchReport { sent: Vec::new(), failed: Vec::new() };

        for channel_kind in targets {
            let outcome = match self.channels.get(&channel_kind) {
                Some(channel) => channel.send(user, title, message).await,
                None => Err(AppError::ExternalDependency(format!("no collaborator registered for {channel_kind}"))),
            };

            let sent_at = if outcome.is_ok() { Some(Utc::now()) } else { None };
            let mut log_metadata = metadata.clone();
            if let Err(ref err) = outcome {
                log_metadata["error"] = serde_json::Value::String(err.to_string());
            }

            if let Err(err) = self
                .persist_log(project_id, user.id, channel_kind, title, message, log_metadata, sent_at)
                .await
            {
                tracing::warn!(error = %err, channel = %channel_kind, "failed to persist notification log");
            }

            match outcome {
                Ok(()) => report.sent.push(channel_kind),
                Err(err) => {
                    tracing::warn!(channel = %channel_kind, user_id = %user.id, error = %err, "notification delivery failed");
                    report.failed.push((channel_kind, err.to_string()));
                }
            }
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_log(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        channel_kind: Channel,
        title: &str,
        message: &str,
        metadata: serde_json::Value,
        sent_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<NotificationLog, sqlx::Error> {
        let mut uow = self.store.begin().await?;
        let log = uow
            .insert_notification_log(NewNotificationLog {
                project_id,
                user_id: Some(user_id),
                channel: &channel_kind.to_string(),
                title,
                message,
                metadata,
                sent_at,
            })
            .await?;
        uow.commit().await?;
        Ok(log)
    }
}

/// Bridges the ledger's fire-and-forget award notification to the
/// Telegram channel, rendering a small fixed template.
impl BonusAwardNotifier for NotificationService {
    fn notify<'a>(
        &'a self,
        project_id: ProjectId,
        user_id: UserId,
        amount: Money,
        description: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Ok(Some(user)) = self.store.find_user(user_id).await else {
                tracing::warn!(%user_id, "award notification skipped: user not found");
                return;
            };
            if user.telegram_id.is_none() {
                return;
            }
            let mut vars = HashMap::new();
            vars.insert("amount".to_string(), amount.to_string());
            vars.insert("description".to_string(), description.to_string());
            let message = Self::render_template("Начислено {{amount}} бонусов: {{description}}", &vars);

            let outcome = self
                .dispatch(project_id, &user, "Начисление бонусов", &message, serde_json::json!({}), Some(&[Channel::Telegram]))
                .await;
            if let Err(err) = outcome {
                tracing::warn!(%user_id, error = %err, "award notification dispatch failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_substitutes_known_vars() {
        let mut vars = HashMap::new();
        vars.insert("amount".to_string(), "50.00".to_string());
        let out = NotificationService::render_template("You earned {{amount}} points", &vars);
        assert_eq!(out, "You earned 50.00 points");
    }

    #[test]
    fn render_template_leaves_unknown_placeholders_blank() {
        let vars = HashMap::new();
        let out = NotificationService::render_template("Hi {{name}}!", &vars);
        assert_eq!(out, "Hi !");
    }

    #[test]
    fn render_template_passes_through_plain_text() {
        let vars = HashMap::new();
        assert_eq!(NotificationService::render_template("no placeholders", &vars), "no placeholders");
    }

    #[test]
    fn quiet_hour_detects_overnight_window() {
        let policy = NotificationPolicy::default();
        let late = chrono::DateTime::parse_from_rfc3339("2026-01-01T23:30:00Z").unwrap().with_timezone(&Utc);
        let midday = chrono::DateTime::parse_from_rfc3339("2026-01-01T13:00:00Z").unwrap().with_timezone(&Utc);
        assert!(policy.is_quiet_hour(late));
        assert!(!policy.is_quiet_hour(midday));
    }
}
