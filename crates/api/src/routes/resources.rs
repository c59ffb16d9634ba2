//! Server purchase and payment webhook endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use bus::InMemoryDedupGuard;
use chrono::{DateTime, Utc};
use common::ResourceId;
use lifecycle::Stage;
use serde::{Deserialize, Serialize};
use services::{
    CheckoutService, InMemoryPaymentGateway, InMemoryProvisioner, ProvisioningService,
};
use store::Storage;

use crate::error::ApiError;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "webhook-signature";

/// Shared application state accessible from all handlers.
pub struct AppState<S: Storage> {
    pub checkout: CheckoutService<S, InMemoryPaymentGateway>,
    pub provisioning: Arc<ProvisioningService<S, InMemoryProvisioner, InMemoryDedupGuard>>,
    pub storage: S,
}

// -- Request types --

#[derive(Deserialize)]
pub struct RequestServerRequest {
    pub hours_reserved: u32,
    pub email: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct ServerRequestedResponse {
    pub resource_id: String,
    pub payment_redirect: String,
}

#[derive(Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub provider_instance_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct ResourceResponse {
    pub id: String,
    pub stage: String,
    pub hours_reserved: u32,
    pub owner_contact: String,
    pub payment_received_at: Option<DateTime<Utc>>,
    pub instance: Option<InstanceSummary>,
}

// -- Handlers --

/// POST /resources — request a new server and start a checkout session.
#[tracing::instrument(skip(state, req))]
pub async fn request<S: Storage + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<RequestServerRequest>,
) -> Result<(StatusCode, Json<ServerRequestedResponse>), ApiError> {
    let request = state
        .checkout
        .request_resource(req.hours_reserved, &req.email)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ServerRequestedResponse {
            resource_id: request.resource_id.to_string(),
            payment_redirect: request.payment_redirect,
        }),
    ))
}

/// POST /payments/callback — raw payment-completion webhook.
#[tracing::instrument(skip(state, headers, body))]
pub async fn payment_callback<S: Storage + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing webhook signature".to_string()))?;

    state.checkout.handle_webhook(&body, signature).await?;

    Ok(StatusCode::OK)
}

/// GET /resources/{id} — load a resource and its lifecycle stage.
#[tracing::instrument(skip(state))]
pub async fn get<S: Storage + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<ResourceResponse>, ApiError> {
    let resource_id = parse_resource_id(&id)?;
    let resource = state.checkout.resource_details(resource_id).await?;

    let instance = state
        .storage
        .instance_for_resource(resource_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    // Past payment, the stage lives on the instance record.
    let stage: Stage = instance
        .as_ref()
        .map(|i| i.stage())
        .unwrap_or_else(|| resource.stage());

    Ok(Json(ResourceResponse {
        id: resource.id.to_string(),
        stage: stage.to_string(),
        hours_reserved: resource.hours_reserved,
        owner_contact: resource.owner_contact.clone(),
        payment_received_at: resource.payment_received_at,
        instance: instance.map(|i| InstanceSummary {
            id: i.id.to_string(),
            provider_instance_id: i.provider_instance_id.clone(),
            expires_at: i.expires_at,
        }),
    }))
}

pub(crate) fn parse_resource_id(id: &str) -> Result<ResourceId, ApiError> {
    uuid::Uuid::parse_str(id)
        .map(ResourceId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid resource id: {e}")))
}
