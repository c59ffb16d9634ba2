//! Instance detail endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::InstanceId;
use serde::Serialize;
use store::Storage;

use crate::error::ApiError;
use crate::routes::resources::AppState;

#[derive(Serialize)]
pub struct InstanceDetailsResponse {
    pub admin_url: String,
    pub ip_addr: String,
    pub expires_on: String,
}

/// GET /instances/{id}/details — connection details for a running instance.
#[tracing::instrument(skip(state))]
pub async fn details<S: Storage + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDetailsResponse>, ApiError> {
    let instance_id = uuid::Uuid::parse_str(&id)
        .map(InstanceId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid instance id: {e}")))?;

    let info = state.provisioning.instance_details(instance_id).await?;

    Ok(Json(InstanceDetailsResponse {
        admin_url: info.admin_url,
        ip_addr: info.ip_addr,
        expires_on: info.expires_at.to_rfc2822(),
    }))
}
