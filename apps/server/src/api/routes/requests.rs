//! Request lifecycle and session routes
//!
//! `/requests/draft` is a static segment and takes precedence over `/requests/:id`.

use crate::api::handlers::{auth, items, requests};
use crate::state::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};

pub fn request_routes() -> Router<AppState> {
    Router::new()
        .route("/requests", get(requests::list_requests))
        .route("/requests/draft", get(requests::draft_summary))
        .route(
            "/requests/:id",
            get(requests::get_request)
                .patch(requests::update_patient_metrics)
                .delete(requests::delete_request),
        )
        .route("/requests/:id/form", put(requests::form_request))
        .route("/requests/:id/complete", put(requests::complete_request))
        .route(
            "/requests/:id/items/:operation_id",
            post(items::add_item)
                .patch(items::update_item)
                .delete(items::remove_item),
        )
        .route("/auth/logout", post(auth::logout))
}
