//! Session handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension};

use crate::{
    auth::{AccessToken, AuthError, Authenticated},
    state::AppState,
};

/// Revoke the presented bearer token for the rest of its validity.
pub async fn logout(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Extension(AccessToken(token)): Extension<AccessToken>,
) -> Result<impl IntoResponse, AuthError> {
    state.auth.revoke(&token).await?;
    tracing::info!(user_id = %identity.user_id, "Logged out");
    Ok(StatusCode::NO_CONTENT)
}
