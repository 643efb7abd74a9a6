//! Webhook Ingress (C5, spec §4.5, §6): the HTTP surface for storefront
//! order events, the Telegram update relay, and the broadcast API.
//!
//! Axum `State`, per-secret auth before any body work, and a thin handler
//! that only parses and delegates to the engines.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::ledger::LedgerEngine;
use crate::money::{self, Money};
use crate::referral::{self, BindOutcome};
use crate::store::{NewUser, Store};
use crate::supervisor::Supervisor;
use crate::types::ProjectId;

/// Shared state for every route in this module.
#[derive(Clone)]
pub struct WebhookState {
    /// Persistence layer, used directly for user resolution.
    pub store: Store,
    /// Accrual/spend engine.
    pub ledger: Arc<LedgerEngine>,
    /// Bot registry, used to route `/telegram/webhook/:project_id` and the
    /// broadcast API.
    pub supervisor: Arc<Supervisor>,
}

/// Build the full axum router (spec §6).
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook/:webhook_secret", post(storefront_webhook))
        .route("/telegram/webhook/:project_id", post(telegram_webhook))
        .route("/projects/:project_id/notifications", post(broadcast))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TestQuery {
    #[serde(default)]
    test: bool,
}

/// A normalized inbound order/registration event, spanning both supported
/// payload shapes (spec §4.5 step 2).
#[derive(Debug, Clone, Default)]
struct OrderEvent {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    order_id: String,
    amount: Money,
    promocode: Option<String>,
    applied_bonuses: Money,
    utm_ref: Option<String>,
}

/// Either a typed action request or a storefront order payload, accepted
/// interchangeably by the same endpoint (spec §4.5).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundPayload {
    Action(ActionPayload),
    Order(StorefrontOrder),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ActionPayload {
    RegisterUser {
        email: Option<String>,
        phone: Option<String>,
        #[serde(default)]
        utm_ref: Option<String>,
    },
    Purchase {
        email: Option<String>,
        phone: Option<String>,
        #[serde(rename = "orderId")]
        order_id: String,
        amount: String,
        #[serde(default)]
        utm_ref: Option<String>,
    },
    SpendBonuses {
        email: Option<String>,
        phone: Option<String>,
        #[serde(rename = "orderId")]
        order_id: String,
        amount: String,
        promocode: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct StorefrontOrder {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Email")]
    email: Option<String>,
    #[serde(rename = "Phone")]
    phone: Option<String>,
    payment: StorefrontPayment,
    #[serde(default, rename = "appliedBonuses")]
    applied_bonuses: Option<String>,
    #[serde(default)]
    utm_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorefrontPayment {
    orderid: String,
    amount: String,
    #[serde(default)]
    promocode: Option<String>,
}

impl InboundPayload {
    /// Canonicalize to one [`OrderEvent`] shape (spec §4.5 step 2).
    fn into_event(self) -> AppResult<OrderEvent> {
        match self {
            InboundPayload::Action(ActionPayload::RegisterUser { email, phone, utm_ref }) => Ok(OrderEvent {
                email,
                phone,
                utm_ref,
                order_id: String::new(),
                amount: Money::ZERO,
                ..Default::default()
            }),
            InboundPayload::Action(ActionPayload::Purchase { email, phone, order_id, amount, utm_ref }) => Ok(OrderEvent {
                email,
                phone,
                order_id,
                amount: parse_amount(&amount)?,
                utm_ref,
                ..Default::default()
            }),
            InboundPayload::Action(ActionPayload::SpendBonuses { email, phone, order_id, amount, promocode }) => Ok(OrderEvent {
                email,
                phone,
                order_id,
                applied_bonuses: parse_amount(&amount)?,
                promocode,
                ..Default::default()
            }),
            InboundPayload::Order(order) => Ok(OrderEvent {
                name: order.name,
                email: order.email,
                phone: order.phone,
                order_id: order.payment.orderid,
                amount: parse_amount(&order.payment.amount)?,
                promocode: order.payment.promocode,
                applied_bonuses: match order.applied_bonuses {
                    Some(raw) => parse_amount(&raw)?,
                    None => Money::ZERO,
                },
                utm_ref: order.utm_ref,
            }),
        }
    }
}

fn parse_amount(raw: &str) -> AppResult<Money> {
    Money::parse(&money::sanitize_numeric(raw)).map_err(|e| AppError::Validation(e.to_string()))
}

#[derive(Serialize)]
struct WebhookResponse {
    success: bool,
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "awardedBonus", skip_serializing_if = "Option::is_none")]
    awarded_bonus: Option<String>,
    #[serde(rename = "spentBonus", skip_serializing_if = "Option::is_none")]
    spent_bonus: Option<String>,
}

const SPEND_TRIGGER_PROMOCODE: &str = "GUPIL";

/// `POST /webhook/:webhook_secret` (spec §4.5).
async fn storefront_webhook(
    State(state): State<WebhookState>,
    Path(webhook_secret): Path<String>,
    Query(query): Query<TestQuery>,
    Json(payload): Json<InboundPayload>,
) -> Result<impl IntoResponse, AppError> {
    let project = state
        .store
        .find_project_by_webhook_secret(&webhook_secret)
        .await?
        .ok_or(AppError::UnknownWebhookSecret)?;
    if !project.is_active {
        return Err(AppError::ProjectInactive);
    }

    let event = payload.into_event()?;

    if query.test {
        return Ok((StatusCode::OK, Json(json!({ "success": true, "test": true }))));
    }

    let user = resolve_or_create_user(&state.store, project.id, &event).await?;

    let mut spent_bonus = None;
    if event.applied_bonuses.is_positive() && is_spend_trigger(event.promocode.as_deref()) {
        let balance = state.ledger.get_balance(user.id).await?;
        let to_spend = event.applied_bonuses.min(balance.current_balance);
        if to_spend.is_positive() {
            let spend_order_id = format!("{}spend", event.order_id);
            let written = state
                .ledger
                .spend(user.id, to_spend, "Bonuses applied at checkout", Some(&spend_order_id))
                .await?;
            spent_bonus = written.first().map(|_| to_spend.to_string());
        }
    }

    let mut awarded_bonus = None;
    if !event.order_id.is_empty() {
        let accrual = state
            .ledger
            .award_purchase(project.id, user.id, event.amount, &event.order_id, "Purchase accrual")
            .await?;
        if let Some(lot) = accrual.bonus {
            awarded_bonus = Some(lot.amount.to_string());
        } else if accrual.idempotent_replay {
            awarded_bonus = Some(accrual.transaction.amount.to_string());
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!(WebhookResponse {
            success: true,
            user_id: user.id.to_string(),
            awarded_bonus,
            spent_bonus,
        })),
    ))
}

fn is_spend_trigger(promocode: Option<&str>) -> bool {
    promocode.map(|p| p.trim().eq_ignore_ascii_case(SPEND_TRIGGER_PROMOCODE)).unwrap_or(false)
}

async fn resolve_or_create_user(
    store: &Store,
    project_id: ProjectId,
    event: &OrderEvent,
) -> AppResult<crate::store::models::User> {
    if let Some(email) = event.email.as_deref() {
        if let Some(user) = store.find_user_by_email(project_id, email).await? {
            return Ok(user);
        }
    }
    if let Some(phone) = event.phone.as_deref() {
        if let Some(user) = store.find_user_by_phone(project_id, phone).await? {
            return Ok(user);
        }
    }

    let (first_name, last_name) = split_name(event.name.as_deref());

    let mut uow = store.begin().await?;
    let user = uow
        .create_user(NewUser {
            project_id,
            email: event.email.as_deref(),
            phone: event.phone.as_deref(),
            first_name: first_name.as_deref(),
            last_name: last_name.as_deref(),
            utm_source: event.utm_ref.as_deref(),
        })
        .await?;

    let bind_outcome = referral::bind_on_register(&mut uow, project_id, &user, event.utm_ref.as_deref()).await?;
    uow.commit().await?;

    if let BindOutcome::Bound(referrer_id) = bind_outcome {
        tracing::info!(%referrer_id, user_id = %user.id, "referral bound on registration");
    }

    Ok(user)
}

fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = name else { return (None, None) };
    let mut parts = name.splitn(2, ' ');
    let first = parts.next().map(str::to_string).filter(|s| !s.is_empty());
    let last = parts.next().map(str::to_string).filter(|s| !s.is_empty());
    (first, last)
}

/// `POST /telegram/webhook/:project_id` (spec §4.5/§4.7): routes to the
/// active worker's update handler, `404` when none is running.
async fn telegram_webhook(
    State(state): State<WebhookState>,
    Path(project_id): Path<ProjectId>,
    Json(update): Json<teloxide::types::Update>,
) -> Result<StatusCode, StatusCode> {
    match state.supervisor.webhook_worker(project_id).await {
        Some(worker) => {
            worker.handle_webhook_update(update).await;
            Ok(StatusCode::OK)
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    #[allow(dead_code)]
    r#type: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    title: Option<String>,
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    channel: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    priority: Option<String>,
    #[serde(default)]
    metadata: BroadcastMetadata,
    #[serde(default, rename = "userIds")]
    user_ids: Vec<crate::types::UserId>,
}

#[derive(Debug, Default, Deserialize)]
struct BroadcastMetadata {
    #[serde(default, rename = "imageUrl")]
    image_url: Option<String>,
    #[serde(default)]
    buttons: Vec<BroadcastButton>,
    #[serde(default, rename = "parseMode")]
    parse_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastButton {
    text: String,
    data: String,
}

/// `POST /projects/:project_id/notifications` (spec §4.7 `sendRichBroadcast`, §6).
async fn broadcast(
    State(state): State<WebhookState>,
    Path(project_id): Path<ProjectId>,
    Json(request): Json<BroadcastRequest>,
) -> Json<serde_json::Value> {
    let buttons: Vec<(String, String)> = request.metadata.buttons.into_iter().map(|b| (b.text, b.data)).collect();

    let report = state
        .supervisor
        .send_rich_broadcast(
            project_id,
            &request.user_ids,
            &request.message,
            request.metadata.image_url.as_deref(),
            &buttons,
            request.metadata.parse_mode.as_deref(),
        )
        .await;

    Json(json!({
        "success": report.success,
        "total": report.total,
        "sentCount": report.sent_count,
        "failedCount": report.failed_count,
        "errors": report.errors,
        "message": format!("sent {} of {}", report.sent_count, report.total),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spend_trigger_is_case_insensitive_and_trims() {
        assert!(is_spend_trigger(Some(" gupil ")));
        assert!(is_spend_trigger(Some("GUPIL")));
        assert!(!is_spend_trigger(Some("OTHER")));
        assert!(!is_spend_trigger(None));
    }

    #[test]
    fn split_name_handles_single_and_full_names() {
        assert_eq!(split_name(Some("Ada")), (Some("Ada".to_string()), None));
        assert_eq!(split_name(Some("Ada Lovelace")), (Some("Ada".to_string()), Some("Lovelace".to_string())));
        assert_eq!(split_name(None), (None, None));
    }

    #[test]
    fn order_event_parses_storefront_payload() {
        let raw = serde_json::json!({
            "Name": "Jane Doe",
            "Email": "jane@example.com",
            "payment": { "orderid": "o-1", "amount": "1,200.50 RUB", "promocode": "GUPIL" },
            "appliedBonuses": "50.00",
            "utm_ref": "abc"
        });
        let payload: InboundPayload = serde_json::from_value(raw).unwrap();
        let event = payload.into_event().unwrap();
        assert_eq!(event.order_id, "o-1");
        assert_eq!(event.amount.to_string(), "1200.50");
        assert_eq!(event.applied_bonuses.to_string(), "50.00");
        assert_eq!(event.email.as_deref(), Some("jane@example.com"));
    }
}
