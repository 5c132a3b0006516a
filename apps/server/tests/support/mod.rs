//! Shared harness for router-level tests.
//!
//! Each [`TestApp`] owns a router over a fresh in-memory backend, so tests
//! never share state and need no database.

#![allow(dead_code)]

use anyhow::Context as _;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use hemocalc_server::{
    api::create_router,
    auth::Identity,
    config::StorageBackend,
    models::UserId,
    AppState, Config,
};
use serde_json::{json, Value};
use tower::ServiceExt as _;

pub const SECRET: &str = "test-secret-0123456789abcdef";

pub const USER: i64 = 10;
pub const OTHER_USER: i64 = 11;
pub const MODERATOR: i64 = 99;

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::new_with_config(|_| {})
    }

    pub fn new_with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.auth.jwt_secret = SECRET.to_string();
        configure(&mut config);

        let state = AppState::in_memory(config);
        let router = create_router(state.clone());
        Self { router, state }
    }

    pub fn token(&self, user_id: i64, is_moderator: bool) -> String {
        let identity = Identity {
            user_id: UserId(user_id),
            username: format!("user{user_id}"),
            is_moderator,
        };
        self.state
            .auth
            .issue(&identity, None)
            .expect("issue test token")
    }

    pub fn user_token(&self) -> String {
        self.token(USER, false)
    }

    pub fn moderator_token(&self) -> String {
        self.token(MODERATOR, true)
    }

    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        let mut builder = Request::builder().method(method).uri(path_and_query);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?)),
            None => builder.body(Body::empty()),
        }
        .context("build request")?;

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("dispatch request")?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("read response body")?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        Ok((status, headers, body))
    }

    /// Create an active catalog operation as a moderator; returns its id.
    pub async fn seed_operation(&self, title: &str, coeff: f64, avg: i32) -> anyhow::Result<i64> {
        let (status, _, body) = self
            .request(
                Method::POST,
                "/api/operations",
                Some(&self.moderator_token()),
                Some(json!({
                    "title": title,
                    "description": "seeded",
                    "blood_loss_coeff": coeff,
                    "avg_blood_loss": avg,
                })),
            )
            .await?;
        assert_status(status, StatusCode::CREATED, "seed operation");
        body["id"].as_i64().context("operation id")
    }
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(actual, expected, "{context}: unexpected status");
}

pub fn error_kind(body: &Value) -> &str {
    body["error"]["kind"].as_str().unwrap_or_default()
}
