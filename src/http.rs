//! HTTP surface for the payment engine.
//!
//! Exposes the inbound webhook endpoints, checkout creation, mobile-money
//! initiate/poll, and a read-only credits view as an [`axum::Router`] the
//! host application nests under its own routing.
//!
//! Webhook contract: 2xx only after verification + reconciliation, so a
//! non-2xx makes the provider redeliver. Duplicate deliveries reconcile to
//! a no-op and still get a 2xx, which is what stops the retries.
//!
//! Authentication of end-user routes is the host application's job; the
//! handlers here trust the user id they are handed.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::checkout::{AccountRef, CheckoutClient, CheckoutManager, CheckoutRedirect};
use crate::error::{Result, TollgateError};
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::metering::{BillableAction, ChargeOutcome, UsageMeter};
use crate::payments::{
    AggregatorWebhook, CardWebhook, InitiatedPayment, MobileMoneyAdapter, MobileMoneyClient,
    PollOutcome,
};
use crate::reconcile::ReconciliationEngine;
use crate::sessions::{PaymentProvider, SessionStatus, SessionStore};

/// Signature header carried by both webhook providers.
const SIGNATURE_HEADER: &str = "x-signature";

/// Shared state for the payment routes.
pub struct PaymentsState<L, S, C, M>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    pub ledger: Arc<L>,
    pub engine: Arc<ReconciliationEngine<L, S>>,
    pub checkout: Arc<CheckoutManager<L, S, C>>,
    pub mobile_money: Arc<MobileMoneyAdapter<S, M>>,
    pub meter: Arc<UsageMeter<L>>,
    pub card: Arc<CardWebhook>,
    pub aggregator: Arc<AggregatorWebhook>,
}

impl<L, S, C, M> Clone for PaymentsState<L, S, C, M>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            engine: self.engine.clone(),
            checkout: self.checkout.clone(),
            mobile_money: self.mobile_money.clone(),
            meter: self.meter.clone(),
            card: self.card.clone(),
            aggregator: self.aggregator.clone(),
        }
    }
}

/// Build the payment router.
pub fn router<L, S, C, M>(state: PaymentsState<L, S, C, M>) -> Router
where
    L: LedgerStore + 'static,
    S: SessionStore + 'static,
    C: CheckoutClient + 'static,
    M: MobileMoneyClient + 'static,
{
    Router::new()
        .route("/webhooks/card", post(card_webhook::<L, S, C, M>))
        .route("/webhooks/aggregator", post(aggregator_webhook::<L, S, C, M>))
        .route("/checkout/sessions", post(create_checkout::<L, S, C, M>))
        .route("/payments/mobile", post(mobile_initiate::<L, S, C, M>))
        .route("/payments/mobile/{id}/poll", post(mobile_poll::<L, S, C, M>))
        .route("/credits/{user_id}", get(get_credits::<L, S, C, M>))
        .route("/usage/charge", post(charge_action::<L, S, C, M>))
        .with_state(state)
}

// ============================================================================
// Webhooks
// ============================================================================

/// Outcome body returned to webhook providers.
#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
}

fn signature_header(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| TollgateError::BadRequest("Missing signature header".to_string()))
}

async fn card_webhook<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let signature = signature_header(&headers)?;
    let event = state.card.verify(&body, signature)?;

    let Some(intent) = state.card.intent(&event)? else {
        return Ok(Json(WebhookResponse { status: "ignored" }));
    };

    state.engine.process(&intent).await?;
    Ok(Json(WebhookResponse { status: "processed" }))
}

async fn aggregator_webhook<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let signature = signature_header(&headers)?;
    let event = state.aggregator.verify(&body, signature)?;

    let Some(intent) = state.aggregator.intent(&event)? else {
        return Ok(Json(WebhookResponse { status: "ignored" }));
    };

    state.engine.process(&intent).await?;
    Ok(Json(WebhookResponse { status: "processed" }))
}

// ============================================================================
// Checkout
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateCheckoutRequest {
    user_id: String,
    email: String,
    provider: PaymentProvider,
    package: String,
    return_url: String,
}

struct RequestAccount<'a> {
    user_id: &'a str,
    email: &'a str,
}

impl AccountRef for RequestAccount<'_> {
    fn user_id(&self) -> &str {
        self.user_id
    }
    fn email(&self) -> &str {
        self.email
    }
}

async fn create_checkout<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutRedirect>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let account = RequestAccount {
        user_id: &request.user_id,
        email: &request.email,
    };
    let redirect = state
        .checkout
        .create_session(&account, request.provider, &request.package, &request.return_url)
        .await?;
    Ok(Json(redirect))
}

// ============================================================================
// Mobile money
// ============================================================================

#[derive(Debug, Deserialize)]
struct MobileInitiateRequest {
    user_id: String,
    package: String,
    phone: String,
}

async fn mobile_initiate<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    Json(request): Json<MobileInitiateRequest>,
) -> Result<Json<InitiatedPayment>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let initiated = state
        .mobile_money
        .initiate(&request.user_id, &request.package, &request.phone)
        .await?;
    Ok(Json(initiated))
}

#[derive(Debug, Serialize)]
struct PollResponse {
    status: SessionStatus,
}

async fn mobile_poll<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let status = match state.mobile_money.poll(&id).await? {
        PollOutcome::StillPending => SessionStatus::Pending,
        PollOutcome::AlreadySettled(status) => status,
        PollOutcome::Resolved(intent) => state.engine.reconcile(&id, &intent).await?.status(),
    };
    Ok(Json(PollResponse { status }))
}

// ============================================================================
// Credits & metering
// ============================================================================

#[derive(Debug, Serialize)]
struct CreditsResponse {
    user_id: String,
    balance: i64,
    entries: Vec<LedgerEntry>,
}

async fn get_credits<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    Path(user_id): Path<String>,
) -> Result<Json<CreditsResponse>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let balance = state.ledger.balance(&user_id).await?;
    let entries = state.ledger.entries(&user_id, 20).await?;
    Ok(Json(CreditsResponse {
        user_id,
        balance,
        entries,
    }))
}

#[derive(Debug, Deserialize)]
struct ChargeRequest {
    user_id: String,
    action: BillableAction,
}

async fn charge_action<L, S, C, M>(
    State(state): State<PaymentsState<L, S, C, M>>,
    Json(request): Json<ChargeRequest>,
) -> Result<Json<ChargeOutcome>>
where
    L: LedgerStore,
    S: SessionStore,
    C: CheckoutClient,
    M: MobileMoneyClient,
{
    let outcome = state.meter.charge(&request.user_id, request.action).await?;
    if !outcome.authorized {
        // Surfaced as a user-actionable condition, not silently retried.
        return Err(crate::payments::PaymentError::InsufficientCredits {
            needed: outcome.cost,
            available: outcome.balance,
        }
        .into());
    }
    Ok(Json(outcome))
}
