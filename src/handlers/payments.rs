//! HTTP surface of the escrow payment coordinator.

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::middleware::auth::AuthSubject;
use crate::ports::Charge;
use crate::services::coordinator::CreateTransactionInput;

#[derive(Debug, Deserialize, Default)]
pub struct CreateIntentMetadata {
    pub conversation_id: Option<String>,
    pub handoff_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    /// Minor currency units (cents).
    pub amount: i64,
    pub currency: String,
    pub product_id: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub product_title: String,
    pub is_digital: bool,
    #[serde(default)]
    pub metadata: CreateIntentMetadata,
}

#[derive(Debug, Serialize)]
pub struct CreateIntentResponse {
    pub client_secret: String,
    pub payment_intent_id: String,
}

pub async fn create_intent(
    State(state): State<AppState>,
    Extension(subject): Extension<AuthSubject>,
    Json(payload): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let output = state
        .coordinator
        .create_transaction(
            CreateTransactionInput {
                amount: payload.amount,
                currency: payload.currency,
                product_id: payload.product_id,
                seller_id: payload.seller_id,
                buyer_id: payload.buyer_id,
                product_title: payload.product_title,
                is_digital: payload.is_digital,
                conversation_id: payload.metadata.conversation_id,
                handoff_code: payload.metadata.handoff_code,
            },
            &subject.0,
        )
        .await?;

    Ok(Json(CreateIntentResponse {
        client_secret: output.client_secret,
        payment_intent_id: output.payment_intent_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub payment_intent_id: String,
    pub payment_method_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub payment_intent: Charge,
}

pub async fn confirm(
    State(state): State<AppState>,
    Extension(subject): Extension<AuthSubject>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, AppError> {
    let output = state
        .coordinator
        .confirm_payment(
            &payload.payment_intent_id,
            &payload.payment_method_id,
            &subject.0,
        )
        .await?;

    Ok(Json(ConfirmResponse {
        success: output.success,
        payment_intent: output.payment_intent,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyHandoffRequest {
    pub transaction_id: String,
    pub handoff_code: String,
    pub seller_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyHandoffResponse {
    pub success: bool,
    pub message: String,
}

pub async fn verify_handoff(
    State(state): State<AppState>,
    Extension(subject): Extension<AuthSubject>,
    Json(payload): Json<VerifyHandoffRequest>,
) -> Result<impl IntoResponse, AppError> {
    // The body names the seller it claims to act for; it must be the caller.
    if payload.seller_id != subject.0 {
        return Err(AppError::Unauthorized(
            "seller_id does not match the authenticated subject".to_string(),
        ));
    }

    state
        .coordinator
        .verify_handoff_and_release(&payload.transaction_id, &payload.handoff_code, &subject.0)
        .await?;

    Ok(Json(VerifyHandoffResponse {
        success: true,
        message: "Transaction completed successfully".to_string(),
    }))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Extension(subject): Extension<AuthSubject>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.coordinator.get_transaction(&id, &subject.0).await?;
    Ok(Json(tx))
}
