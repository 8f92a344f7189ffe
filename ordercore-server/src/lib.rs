//! # ordercore-server
//!
//! HTTP surface of the `OrderCore` engine.
//!
//! | Route | Success | Failures |
//! |---|---|---|
//! | `POST /orders` | `201` with the order | `400` invalid input, `409` out of stock, `503` contention, `500` |
//! | `GET /orders/{id}` | `200` with the order | `404` |
//! | `POST /webhooks/payment` | `200`, empty body | `400` missing fields, `500` |
//! | `POST /webhooks/shipping` | `200`, empty body | `400` missing fields, `500` |
//! | `GET /health` | `200 ok` | |
//!
//! Every mutating route accepts an optional `X-Triggered-By` header naming
//! the authenticated caller; it is recorded on the order's stage history.

pub mod config;
pub mod error;
pub mod logging;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use ordercore::model::Order;
use ordercore::reservation::CreateOrderRequest;
use ordercore::types::{OrderId, TriggeredBy};
use ordercore::webhook::CallbackPayload;
use ordercore::Engine;
use tracing::instrument;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use logging::{init_logging, LogFormat};

/// Header carrying the authenticated caller.
pub const TRIGGERED_BY_HEADER: &str = "x-triggered-by";

/// State shared by the handlers.
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
}

impl AppState {
    /// Wraps an engine.
    pub const fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// The engine behind the routes.
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/webhooks/shipping", post(shipping_webhook))
        .with_state(state)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn triggered_by(headers: &HeaderMap) -> Result<Option<TriggeredBy>, ApiError> {
    let Some(raw) = headers.get(TRIGGERED_BY_HEADER) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| ApiError::bad_request("X-Triggered-By must be visible ASCII"))?;
    TriggeredBy::try_new(raw)
        .map(Some)
        .map_err(|error| ApiError::bad_request(format!("invalid X-Triggered-By: {error}")))
}

#[instrument(skip_all)]
async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let caller = triggered_by(&headers)?;
    let Json(mut request) = payload?;
    if caller.is_some() {
        request.triggered_by = caller;
    }
    let order = state.engine.reservations().create_order(request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

#[instrument(skip(state))]
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let id = OrderId::try_new(id.as_str())
        .map_err(|_| ApiError::not_found(format!("order {id} not found")))?;
    state
        .engine
        .store()
        .order(&id)
        .await?
        .map(|versioned| Json(versioned.document))
        .ok_or_else(|| ApiError::not_found(format!("order {id} not found")))
}

#[instrument(skip_all)]
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CallbackPayload>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let caller = triggered_by(&headers)?;
    let Json(payload) = payload?;
    state
        .engine
        .webhooks()
        .handle_payment_callback(&payload, caller.as_ref())
        .await?;
    Ok(StatusCode::OK)
}

#[instrument(skip_all)]
async fn shipping_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CallbackPayload>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let caller = triggered_by(&headers)?;
    let Json(payload) = payload?;
    state
        .engine
        .webhooks()
        .handle_shipping_callback(&payload, caller.as_ref())
        .await?;
    Ok(StatusCode::OK)
}
