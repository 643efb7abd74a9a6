//! Bot Supervisor (C7, spec §4.7): process-singleton registry of one
//! [`BotWorker`] per project.
//!
//! Create/update/stop operations on the same project are strictly
//! serialized by a per-project `tokio::sync::Mutex<()>` guard, the same
//! single-flight-per-key shape used elsewhere for serialized state
//! transitions, so unrelated projects never block each other (spec §5
//! "Across projects... fully parallel").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::bot::{BotWorker, DeliveryMode};
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerEngine;
use crate::store::models::BotSettings;
use crate::store::Store;
use crate::types::ProjectId;

/// Report returned by [`Supervisor::send_rich_broadcast`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcastReport {
    /// `true` when every recipient succeeded.
    pub success: bool,
    /// Recipients attempted.
    pub total: usize,
    /// Recipients that accepted delivery.
    pub sent_count: usize,
    /// Recipients that failed.
    pub failed_count: usize,
    /// `(user_id, reason)` for every failed recipient.
    pub errors: Vec<(String, String)>,
}

/// Health snapshot returned by [`Supervisor::check_bot_health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct BotHealth {
    /// `true` when a worker is registered and running for this project.
    pub is_running: bool,
    /// Delivery mode, if running.
    pub mode: Option<&'static str>,
    /// Last known error, if any (not currently tracked beyond startup).
    pub error: Option<String>,
}

const BROADCAST_CONCURRENCY: usize = 8;
const CREATE_SETTLE_DELAY: Duration = Duration::from_secs(1);
const EMERGENCY_STOP_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// The process-singleton supervisor (spec §4.7).
pub struct Supervisor {
    store: Store,
    ledger: Arc<LedgerEngine>,
    public_app_url: String,
    prefers_polling: bool,
    workers: RwLock<HashMap<ProjectId, Arc<BotWorker>>>,
    locks: Mutex<HashMap<ProjectId, Arc<Mutex<()>>>>,
}

impl Supervisor {
    /// Build an empty supervisor. `prefers_polling` mirrors
    /// [`crate::config::Config::prefers_polling`] and picks the delivery
    /// mode every newly-created worker starts in.
    pub fn new(store: Store, ledger: Arc<LedgerEngine>, public_app_url: String, prefers_polling: bool) -> Self {
        Self {
            store,
            ledger,
            public_app_url,
            prefers_polling,
            workers: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, project_id: ProjectId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(project_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// The ledger this supervisor's workers award and spend through, so the
    /// composition root can share one instance between the supervisor and
    /// the webhook ingress rather than constructing a second one.
    pub fn ledger(&self) -> Arc<LedgerEngine> {
        Arc::clone(&self.ledger)
    }

    /// `createBot` (spec §4.7): stop any existing worker, wait 1s so
    /// Telegram releases the previous long-polling consumer, then start a
    /// fresh one in the runtime-selected delivery mode.
    pub async fn create_bot(&self, project_id: ProjectId, settings: &BotSettings) -> AppResult<()> {
        let project_lock = self.lock_for(project_id).await;
        let _guard = project_lock.lock().await;

        self.stop_bot_locked(project_id).await;
        tokio::time::sleep(CREATE_SETTLE_DELAY).await;

        let worker = Arc::new(
            BotWorker::initialize(
                project_id,
                &settings.bot_token,
                self.store.clone(),
                Arc::clone(&self.ledger),
                self.public_app_url.clone(),
            )
            .await?,
        );

        if self.prefers_polling {
            worker.start_polling().await?;
        } else {
            let webhook_url = format!("{}/telegram/webhook/{}", self.public_app_url.trim_end_matches('/'), project_id);
            worker.start_webhook(&webhook_url).await?;
        }

        self.workers.write().await.insert(project_id, worker);
        info!(%project_id, "bot worker created");
        Ok(())
    }

    /// `updateBot` (spec §4.7): recreate on token change, otherwise toggle
    /// active state (stopping if deactivated).
    pub async fn update_bot(&self, project_id: ProjectId, settings: &BotSettings, token_changed: bool) -> AppResult<()> {
        if token_changed {
            return self.create_bot(project_id, settings).await;
        }

        let project_lock = self.lock_for(project_id).await;
        let _guard = project_lock.lock().await;

        if !settings.is_active {
            self.stop_bot_locked(project_id).await;
        }
        Ok(())
    }

    /// `stopBot` (spec §4.7). Always removes the worker from the map even
    /// if the underlying Telegram calls error.
    pub async fn stop_bot(&self, project_id: ProjectId) {
        let project_lock = self.lock_for(project_id).await;
        let _guard = project_lock.lock().await;
        self.stop_bot_locked(project_id).await;
    }

    async fn stop_bot_locked(&self, project_id: ProjectId) {
        let worker = self.workers.write().await.remove(&project_id);
        if let Some(worker) = worker {
            worker.stop().await;
            info!(%project_id, "bot worker stopped");
        }
    }

    /// `emergencyStopAll` (spec §4.7): stop every worker in parallel, clear
    /// all state, then settle for 3s before returning.
    pub async fn emergency_stop_all(&self) {
        let workers: Vec<Arc<BotWorker>> = self.workers.write().await.drain().map(|(_, w)| w).collect();
        let mut set = tokio::task::JoinSet::new();
        for worker in workers {
            set.spawn(async move { worker.stop().await });
        }
        while set.join_next().await.is_some() {}
        tokio::time::sleep(EMERGENCY_STOP_SETTLE_DELAY).await;
        warn!("emergency stop: all bot workers stopped");
    }

    /// `getWebhookHandler` (spec §4.7): the worker to route an inbound
    /// Telegram update to, or `None` if this project has no active worker.
    pub async fn webhook_worker(&self, project_id: ProjectId) -> Option<Arc<BotWorker>> {
        self.workers.read().await.get(&project_id).cloned()
    }

    /// `checkBotHealth` (spec §4.7).
    pub async fn check_bot_health(&self, project_id: ProjectId) -> BotHealth {
        match self.workers.read().await.get(&project_id) {
            Some(worker) => {
                let mode = match worker.state().await {
                    crate::bot::WorkerState::Running(DeliveryMode::Polling) => Some("polling"),
                    crate::bot::WorkerState::Running(DeliveryMode::Webhook) => Some("webhook"),
                    _ => None,
                };
                BotHealth { is_running: mode.is_some(), mode, error: None }
            }
            None => BotHealth { is_running: false, mode: None, error: None },
        }
    }

    /// `sendRichBroadcast` (spec §4.7): bounded concurrent fan-out over
    /// `user_ids`, one message each. A single recipient's failure never
    /// aborts the others.
    pub async fn send_rich_broadcast(
        &self,
        project_id: ProjectId,
        user_ids: &[crate::types::UserId],
        message: &str,
        image_url: Option<&str>,
        buttons: &[(String, String)],
        parse_mode: Option<&str>,
    ) -> BroadcastReport {
        let Some(worker) = self.webhook_worker(project_id).await else {
            return BroadcastReport {
                success: false,
                total: user_ids.len(),
                sent_count: 0,
                failed_count: user_ids.len(),
                errors: user_ids.iter().map(|id| (id.to_string(), "no active bot worker for project".to_string())).collect(),
            };
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(BROADCAST_CONCURRENCY));
        let mut set = tokio::task::JoinSet::new();
        for user_id in user_ids.iter().copied() {
            let worker = Arc::clone(&worker);
            let store = self.store.clone();
            let permit = Arc::clone(&semaphore);
            let message = message.to_string();
            let image_url = image_url.map(str::to_string);
            let buttons = buttons.to_vec();
            let parse_mode = parse_mode.map(str::to_string);
            set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                let outcome =
                    broadcast_one(&worker, &store, user_id, &message, image_url.as_deref(), &buttons, parse_mode.as_deref()).await;
                (user_id, outcome)
            });
        }

        let mut report = BroadcastReport {
            success: true,
            total: user_ids.len(),
            sent_count: 0,
            failed_count: 0,
            errors: Vec::new(),
        };
        while let Some(joined) = set.join_next().await {
            let Ok((user_id, outcome)) = joined else {
                report.failed_count += 1;
                report.success = false;
                continue;
            };
            match outcome {
                Ok(()) => report.sent_count += 1,
                Err(reason) => {
                    report.failed_count += 1;
                    report.success = false;
                    report.errors.push((user_id.to_string(), reason));
                }
            }
        }
        report
    }
}

async fn broadcast_one(
    worker: &BotWorker,
    store: &Store,
    user_id: crate::types::UserId,
    message: &str,
    image_url: Option<&str>,
    buttons: &[(String, String)],
    parse_mode: Option<&str>,
) -> Result<(), String> {
    let user = store.find_user(user_id).await.map_err(|e| e.to_string())?;
    let Some(user) = user else {
        return Err("user not found".to_string());
    };
    let Some(telegram_id) = user.telegram_id else {
        return Err("not linked".to_string());
    };
    worker.send_rich_message(telegram_id, message, image_url, buttons, parse_mode).await.map_err(|e| e.to_string())
}

/// Bridges [`crate::notification::NotificationChannel`] to the supervisor's
/// per-project workers, since each project's Telegram delivery goes through
/// its own bot token rather than one process-wide `Bot` (spec §4.7/§4.8).
///
/// Holds a [`std::sync::Weak`] rather than a strong `Arc` because the
/// supervisor owns the ledger which owns the notifier which owns this
/// channel; a strong back-reference here would be a reference cycle. The
/// composition root builds the supervisor with `Arc::new_cyclic` and hands
/// this channel the weak half before the strong `Arc` exists.
pub struct SupervisorTelegramChannel {
    supervisor: std::sync::Weak<Supervisor>,
}

impl SupervisorTelegramChannel {
    /// Wrap a weak handle to the supervisor as a notification channel.
    pub fn new(supervisor: std::sync::Weak<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl crate::notification::NotificationChannel for SupervisorTelegramChannel {
    fn channel(&self) -> crate::types::Channel {
        crate::types::Channel::Telegram
    }

    async fn send(&self, user: &crate::store::models::User, title: &str, message: &str) -> AppResult<()> {
        let telegram_id = user
            .telegram_id
            .ok_or_else(|| AppError::Validation("user has no linked telegram account".to_string()))?;
        let supervisor = self
            .supervisor
            .upgrade()
            .ok_or_else(|| AppError::Internal("supervisor shut down".to_string()))?;
        let worker = supervisor.webhook_worker(user.project_id).await.ok_or_else(|| not_running(user.project_id))?;

        let body = if title.is_empty() { message.to_string() } else { format!("{title}\n{message}") };
        worker.send_rich_message(telegram_id, &body, None, &[], None).await
    }
}

/// Surface [`AppError::NotFound`] for call sites that need a typed failure
/// instead of a formatted string (e.g. the notification bridge).
pub fn not_running(project_id: ProjectId) -> AppError {
    AppError::NotFound(format!("no active bot worker for project {project_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn not_running_is_a_not_found_error() {
        let project_id = ProjectId::new_v4();
        assert_eq!(not_running(project_id).kind(), ErrorKind::NotFound);
    }
}
