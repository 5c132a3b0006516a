//! Request item handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::{
    api::extractors::ApiJson,
    auth::Authenticated,
    models::{ItemMeasurements, ItemUpdate, OperationId, RequestId},
    state::AppState,
    Result,
};

pub async fn add_item(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path((id, operation_id)): Path<(RequestId, OperationId)>,
    ApiJson(measurements): ApiJson<ItemMeasurements>,
) -> Result<impl IntoResponse> {
    let item = state
        .lifecycle
        .add_item(id, identity.caller(), operation_id, measurements)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn update_item(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path((id, operation_id)): Path<(RequestId, OperationId)>,
    ApiJson(update): ApiJson<ItemUpdate>,
) -> Result<impl IntoResponse> {
    let item = state
        .lifecycle
        .update_item(id, identity.caller(), operation_id, update)
        .await?;
    Ok(Json(item))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path((id, operation_id)): Path<(RequestId, OperationId)>,
) -> Result<impl IntoResponse> {
    state
        .lifecycle
        .remove_item(id, identity.caller(), operation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
