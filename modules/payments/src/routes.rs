//! Payments HTTP routes
//!
//! Thin JSON surface over the submission path and point reads.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::models::{Payment, PaymentId, SubmitPayment};
use crate::store::StoreError;
use crate::submission::{SubmissionService, SubmitError};

#[derive(Clone)]
pub struct AppState {
    pub submissions: Arc<SubmissionService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/{id}", get(get_payment))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "payments",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Handler for POST /api/payments
///
/// 201 with the pending payment. When the payment was stored but could not be
/// queued the response is 503 and still carries the payment id.
pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<SubmitPayment>,
) -> Result<(StatusCode, Json<Payment>), PaymentApiError> {
    let payment = state.submissions.submit(request).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// Handler for GET /api/payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, PaymentApiError> {
    let id = id
        .parse::<PaymentId>()
        .map_err(|_| PaymentApiError::new(StatusCode::BAD_REQUEST, format!("invalid payment id: {}", id)))?;

    let payment = state.submissions.get(id).await?;
    Ok(Json(payment))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<PaymentId>,
}

/// Error response wrapper for proper HTTP error handling
#[derive(Debug)]
pub struct PaymentApiError {
    pub status: StatusCode,
    pub message: String,
    pub payment_id: Option<PaymentId>,
}

impl PaymentApiError {
    fn new(status: StatusCode, message: String) -> Self {
        Self {
            status,
            message,
            payment_id: None,
        }
    }
}

impl From<SubmitError> for PaymentApiError {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        match err {
            SubmitError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, message),
            SubmitError::DuplicateReference(_) => Self::new(StatusCode::CONFLICT, message),
            SubmitError::QueueUnavailable { payment, .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message,
                payment_id: Some(payment.id),
            },
            SubmitError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for PaymentApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::DuplicateReference(_) => StatusCode::CONFLICT,
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                tracing::error!(error = %err, "Payment store error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for PaymentApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            payment_id: self.payment_id,
        });
        (self.status, body).into_response()
    }
}
