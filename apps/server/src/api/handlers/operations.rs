//! Operation catalog handlers
//!
//! Reads are public. Writes need the moderator role. Adding an operation to
//! the caller's draft lives here too, since it is addressed by operation id.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    api::extractors::{ApiJson, ApiQuery},
    auth::{Authenticated, Moderator},
    models::{ItemMeasurements, NewOperation, OperationFilter, OperationId, OperationPatch, PatientMetrics},
    state::AppState,
    Result,
};

pub async fn list_operations(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<OperationFilter>,
) -> Result<impl IntoResponse> {
    let operations = state.catalog.list(&filter).await?;
    Ok(Json(operations))
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.get(id).await?))
}

pub async fn create_operation(
    State(state): State<AppState>,
    Moderator(_): Moderator,
    ApiJson(operation): ApiJson<NewOperation>,
) -> Result<impl IntoResponse> {
    let created = state.catalog.create(operation).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_operation(
    State(state): State<AppState>,
    Moderator(_): Moderator,
    Path(id): Path<OperationId>,
    ApiJson(patch): ApiJson<OperationPatch>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.update(id, patch).await?))
}

pub async fn archive_operation(
    State(state): State<AppState>,
    Moderator(_): Moderator,
    Path(id): Path<OperationId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.catalog.archive(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct AddToDraftBody {
    #[serde(flatten)]
    pub measurements: ItemMeasurements,
    pub patient_height_cm: Option<f64>,
    pub patient_weight_kg: Option<i32>,
}

pub async fn add_to_draft(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(operation_id): Path<OperationId>,
    ApiJson(body): ApiJson<AddToDraftBody>,
) -> Result<impl IntoResponse> {
    let metrics = PatientMetrics {
        height_cm: body.patient_height_cm,
        weight_kg: body.patient_weight_kg,
    };
    let (request, item) = state
        .lifecycle
        .add_to_draft(identity.caller(), operation_id, body.measurements, metrics)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "request": request, "item": item })),
    ))
}
