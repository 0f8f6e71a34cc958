use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::service::FlashSaleService;
use crate::store::Store;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub struct AppState<S: Store> {
    pub service: Arc<FlashSaleService<S>>,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateHoldRequest {
    pub product_id: Uuid,
    pub qty: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub hold_token: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentWebhookRequest {
    pub status: PaymentStatus,
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub hold_token: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl PaymentWebhookRequest {
    fn into_parts(self) -> (SettlementPayload, Option<String>) {
        let payload = SettlementPayload {
            status: self.status,
            order_id: self.order_id,
            hold_token: self.hold_token,
            failure_reason: self.failure_reason,
        };
        (payload, self.idempotency_key)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
}

fn engine_failure(e: EngineError) -> ApiError {
    match e {
        EngineError::Validation(message) => api_error(StatusCode::BAD_REQUEST, message),
        other => {
            tracing::error!(error = %other, "Request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Malformed bodies are the caller's fault; reject them with 400 rather
/// than axum's default 422, which this API reserves for business rejections.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))
}

pub fn create_router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/products/:id", get(get_product::<S>))
        .route("/holds", post(create_hold::<S>))
        .route("/orders", post(create_order::<S>))
        .route("/payments/webhook", post(payment_webhook::<S>))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn get_product<S: Store>(
    State(state): State<AppState<S>>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductView>, ApiError> {
    match state.service.product(product_id).await.map_err(engine_failure)? {
        Some(view) => Ok(Json(view)),
        None => Err(api_error(StatusCode::NOT_FOUND, "Product not found")),
    }
}

pub async fn create_hold<S: Store>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> Result<(StatusCode, Json<HoldReceipt>), ApiError> {
    let request: CreateHoldRequest = parse_body(&body)?;

    match state
        .service
        .create_hold(request.product_id, request.qty)
        .await
        .map_err(engine_failure)?
    {
        HoldOutcome::Created(hold) => Ok((StatusCode::CREATED, Json(hold.receipt()))),
        HoldOutcome::InsufficientStock { .. } => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Insufficient stock available",
        )),
        HoldOutcome::ProductNotFound => Err(api_error(StatusCode::NOT_FOUND, "Product not found")),
    }
}

pub async fn create_order<S: Store>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> Result<(StatusCode, Json<OrderReceipt>), ApiError> {
    let request: CreateOrderRequest = parse_body(&body)?;

    match state
        .service
        .create_order(&request.hold_token)
        .await
        .map_err(engine_failure)?
    {
        OrderOutcome::Created(order) => Ok((StatusCode::CREATED, Json(order.receipt()))),
        OrderOutcome::InvalidHold => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid or expired hold token",
        )),
    }
}

/// Replies with the stored status code and the stored body byte for byte,
/// so a redelivered notification sees exactly what the first delivery saw.
pub async fn payment_webhook<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: PaymentWebhookRequest = parse_body(&body)?;
    let (payload, body_key) = request.into_parts();

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let Some(idempotency_key) = header_key.or(body_key) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Idempotency key is required"));
    };

    let response = state
        .service
        .handle_settlement(payload, &idempotency_key)
        .await
        .map_err(engine_failure)?;

    let status = StatusCode::from_u16(response.status_code).map_err(|e| {
        tracing::error!(status = response.status_code, error = %e, "Stored settlement status is not a valid HTTP status");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    Ok((status, [(header::CONTENT_TYPE, "application/json")], response.body).into_response())
}

pub async fn health_check() -> &'static str {
    "OK"
}
