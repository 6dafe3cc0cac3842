//! Webhook receiver and REST API example for the escrow ledger.
//!
//! Run with: `cargo run --example webhook_server`
//!
//! ## Endpoints
//!
//! - `POST /webhooks/processor` - Ingest a signed processor event
//! - `POST /deposits` - Stage a deposit (returns the payment reference)
//! - `POST /deals` - Open a deal
//! - `POST /deals/{id}/fund` - Move the buyer's funds into escrow
//! - `POST /deals/{id}/release` - Complete the deal with the fee split
//! - `GET /owners/{id}/balances` - Available and escrow balances
//! - `GET /reconcile` - Run the invariant sweep
//!
//! ## Example Usage
//!
//! ```bash
//! # Stage a deposit
//! curl -X POST http://localhost:3000/deposits \
//!   -H "Content-Type: application/json" \
//!   -d '{"owner": 1, "amount": 10000}'
//!
//! # Deliver the settlement event (signature is HMAC-SHA256 of the body)
//! curl -X POST http://localhost:3000/webhooks/processor \
//!   -H "Processor-Signature: <hex hmac>" \
//!   -d '{"id": "evt_1", "type": "deposit.succeeded", "payload": {"payment_reference": "pi_1"}}'
//!
//! # Check balances
//! curl http://localhost:3000/owners/1/balances
//! ```

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use escrow_ledger::{
    Actor, Currency, EngineConfig, IngestOutcome, LedgerEngine, LedgerError, MockProcessor,
    OwnerId, PaymentEventIngester,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
struct DepositRequestBody {
    owner: u64,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct OpenDealBody {
    buyer: u64,
    seller: u64,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct ActorBody {
    owner: u64,
}

#[derive(Debug, Serialize)]
struct BalancesResponse {
    owner: u64,
    available: i64,
    escrow: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
struct AppState {
    engine: Arc<LedgerEngine>,
    ingester: Arc<PaymentEventIngester>,
    processor: Arc<MockProcessor>,
    currency: Currency,
}

// === Error Handling ===

/// Wrapper for converting `LedgerError` into HTTP responses.
struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LedgerError::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE"),
            LedgerError::NotPermitted => (StatusCode::FORBIDDEN, "NOT_PERMITTED"),
            LedgerError::AccountNotFound
            | LedgerError::DealNotFound
            | LedgerError::DisputeNotFound
            | LedgerError::UnknownPaymentReference => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            LedgerError::InsufficientBalance => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            LedgerError::InsufficientEscrow => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_ESCROW")
            }
            LedgerError::DealNotOpen
            | LedgerError::DealNotInProgress
            | LedgerError::DealNotDisputed => (StatusCode::CONFLICT, "INVALID_DEAL_STATE"),
            LedgerError::NotRefundEligible => (StatusCode::CONFLICT, "NOT_REFUND_ELIGIBLE"),
            LedgerError::Processor(_) => (StatusCode::BAD_GATEWAY, "PROCESSOR_ERROR"),
            _ => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /webhooks/processor - Verify and ingest one processor event.
///
/// The raw body is verified against the `Processor-Signature` header
/// before parsing. Duplicates and unknown event kinds are acknowledged
/// with 200 so the processor stops retrying them.
async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = headers
        .get("Processor-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(LedgerError::InvalidSignature)?;

    let outcome = state.ingester.ingest(&body, signature)?;
    let outcome = match outcome {
        IngestOutcome::Processed => "processed",
        IngestOutcome::Duplicate => "duplicate",
        IngestOutcome::Ignored => "ignored",
    };
    Ok(Json(json!({ "outcome": outcome })))
}

/// POST /deposits - Stage a deposit with the processor.
async fn create_deposit(
    State(state): State<AppState>,
    Json(body): Json<DepositRequestBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let request = state
        .engine
        .deposit_request(OwnerId(body.owner), body.amount, &state.currency)?;
    // Demo only: the mock processor settles instantly, so the
    // deposit.succeeded event can be delivered right away.
    state.processor.settle_intent(&request.payment_ref);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "deposit_id": request.deposit_id,
            "payment_ref": request.payment_ref,
            "client_secret": request.client_secret,
        })),
    ))
}

/// POST /deals - Open a deal between a buyer and a seller.
async fn open_deal(
    State(state): State<AppState>,
    Json(body): Json<OpenDealBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let deal = state.engine.open_deal(
        OwnerId(body.buyer),
        OwnerId(body.seller),
        body.amount,
        &state.currency,
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "deal_id": deal }))))
}

/// POST /deals/{id}/fund - Escrow the buyer's funds.
async fn fund_deal(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let journal = state
        .engine
        .fund_deal(escrow_ledger::DealId(id), Actor::User(OwnerId(body.owner)))?;
    Ok(Json(json!({ "journal_id": journal })))
}

/// POST /deals/{id}/release - Complete the deal.
async fn release_deal(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = state
        .engine
        .release(escrow_ledger::DealId(id), Actor::User(OwnerId(body.owner)))?;
    Ok(Json(json!({
        "journal_id": outcome.journal_id,
        "seller_amount": outcome.seller_amount,
        "fee": outcome.fee,
        "transfer": outcome.transfer,
    })))
}

/// GET /owners/{id}/balances - Available and escrow balances.
async fn get_balances(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Json<BalancesResponse> {
    let owner = OwnerId(id);
    Json(BalancesResponse {
        owner: id,
        available: state.engine.available_balance(owner, &state.currency),
        escrow: state.engine.escrow_balance(owner, &state.currency),
    })
}

/// GET /reconcile - Run the invariant sweep.
async fn reconcile(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.engine.reconcile();
    Json(json!({
        "clean": report.is_clean(),
        "journals_checked": report.journals_checked,
        "accounts_checked": report.accounts_checked,
        "issues": report.issues,
        "pending_payouts": report.pending_payouts,
        "pending_refunds": report.pending_refunds,
    }))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/processor", post(ingest_event))
        .route("/deposits", post(create_deposit))
        .route("/deals", post(open_deal))
        .route("/deals/{id}/fund", post(fund_deal))
        .route("/deals/{id}/release", post(release_deal))
        .route("/owners/{id}/balances", get(get_balances))
        .route("/reconcile", get(reconcile))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::default();
    let secret = config.webhook_secret.clone();
    let processor = Arc::new(MockProcessor::new());
    let currency = config.currency.clone();
    let engine = Arc::new(LedgerEngine::new(config, processor.clone()));
    let ingester = Arc::new(PaymentEventIngester::new(Arc::clone(&engine), &secret));

    let state = AppState {
        engine,
        ingester,
        processor,
        currency,
    };
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Escrow ledger API running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /webhooks/processor   - Ingest a signed processor event");
    println!("  POST /deposits             - Stage a deposit");
    println!("  POST /deals                - Open a deal");
    println!("  POST /deals/:id/fund       - Escrow the buyer's funds");
    println!("  POST /deals/:id/release    - Complete the deal");
    println!("  GET  /owners/:id/balances  - Available and escrow balances");
    println!("  GET  /reconcile            - Run the invariant sweep");

    axum::serve(listener, app).await.unwrap();
}
