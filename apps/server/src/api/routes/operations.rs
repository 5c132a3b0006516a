//! Operation catalog routes

use crate::api::handlers::operations;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn operation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/operations",
            get(operations::list_operations).post(operations::create_operation),
        )
        .route(
            "/operations/:id",
            get(operations::get_operation)
                .patch(operations::update_operation)
                .delete(operations::archive_operation),
        )
        .route("/operations/:id/draft", post(operations::add_to_draft))
}
