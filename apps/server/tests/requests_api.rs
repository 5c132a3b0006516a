//! Request lifecycle over HTTP
//!
//! Covers:
//! - draft creation through the catalog and item CRUD
//! - Form preconditions and Complete with estimate / manual / fallback totals
//! - ownership and role checks
//! - listings, date filters and logical delete
//! - token revocation on logout

mod support;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};
use support::{assert_status, error_kind, TestApp, OTHER_USER};

async fn draft_with_item(app: &TestApp, operation_id: i64, body: Value) -> anyhow::Result<i64> {
    let (status, _, created) = app
        .request(
            Method::POST,
            &format!("/api/operations/{operation_id}/draft"),
            Some(&app.user_token()),
            Some(body),
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "add to draft");
    Ok(created["request"]["id"].as_i64().unwrap())
}

fn full_item_with_patient() -> Value {
    json!({
        "hb_before": 140,
        "hb_after": 120,
        "surgery_duration_hours": 2.0,
        "patient_height_cm": 175.0,
        "patient_weight_kg": 70,
    })
}

#[tokio::test]
async fn full_lifecycle_completes_with_estimate() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let moderator = app.moderator_token();
    let op = app.seed_operation("Hip replacement", 0.12, 1250).await?;

    let id = draft_with_item(&app, op, full_item_with_patient()).await?;

    let (status, _, formed) = app
        .request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    assert_status(status, StatusCode::OK, "form");
    assert_eq!(formed["status"], "formed");
    assert!(formed["formed_at"].is_string());

    let (status, _, completion) = app
        .request(
            Method::PUT,
            &format!("/api/requests/{id}/complete"),
            Some(&moderator),
            None,
        )
        .await?;
    assert_status(status, StatusCode::OK, "complete");
    assert_eq!(completion["total_blood_loss_ml"], 854);
    assert_eq!(completion["items"][0]["source"], "estimated");

    let (status, _, detail) = app
        .request(Method::GET, &format!("/api/requests/{id}"), Some(&user), None)
        .await?;
    assert_status(status, StatusCode::OK, "detail");
    assert_eq!(detail["status"], "completed");
    assert_eq!(detail["moderator_id"], support::MODERATOR);
    assert_eq!(detail["calculated_count"], 1);
    assert_eq!(detail["items"][0]["total_blood_loss_ml"], 854);
    assert_eq!(detail["items"][0]["title"], "Hip replacement");

    let (status, _, body) = app
        .request(
            Method::PUT,
            &format!("/api/requests/{id}/complete"),
            Some(&moderator),
            None,
        )
        .await?;
    assert_status(status, StatusCode::CONFLICT, "second complete");
    assert_eq!(error_kind(&body), "invalid_state");
    Ok(())
}

#[tokio::test]
async fn completion_mixes_manual_and_fallback_totals() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let knee = app.seed_operation("Knee arthroscopy", 0.2, 300).await?;
    let spine = app.seed_operation("Spinal fusion", 0.5, 900).await?;

    let id = draft_with_item(
        &app,
        knee,
        json!({ "total_blood_loss_ml": 500, "patient_height_cm": 180.0, "patient_weight_kg": 80 }),
    )
    .await?;
    let (status, _, _) = app
        .request(
            Method::POST,
            &format!("/api/requests/{id}/items/{spine}"),
            Some(&user),
            Some(json!({ "hb_before": 130 })),
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "add item");

    app.request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    let (status, _, completion) = app
        .request(
            Method::PUT,
            &format!("/api/requests/{id}/complete"),
            Some(&app.moderator_token()),
            None,
        )
        .await?;
    assert_status(status, StatusCode::OK, "complete");
    assert_eq!(completion["total_blood_loss_ml"], 500 + 450);

    let sources: Vec<&str> = completion["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["source"].as_str().unwrap())
        .collect();
    assert!(sources.contains(&"manual"));
    assert!(sources.contains(&"fallback"));
    Ok(())
}

#[tokio::test]
async fn form_requires_patient_metrics_and_items() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let op = app.seed_operation("Appendectomy", 0.1, 100).await?;

    let id = draft_with_item(&app, op, json!({ "hb_before": 120 })).await?;
    let (status, _, body) = app
        .request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    assert_status(status, StatusCode::PRECONDITION_FAILED, "form without metrics");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("patient_height_cm"));

    let (status, _, _) = app
        .request(
            Method::PATCH,
            &format!("/api/requests/{id}"),
            Some(&user),
            Some(json!({ "patient_height_cm": 170.0, "patient_weight_kg": 65 })),
        )
        .await?;
    assert_status(status, StatusCode::OK, "set metrics");

    let (status, _, _) = app
        .request(
            Method::DELETE,
            &format!("/api/requests/{id}/items/{op}"),
            Some(&user),
            None,
        )
        .await?;
    assert_status(status, StatusCode::NO_CONTENT, "remove item");

    let (status, _, body) = app
        .request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    assert_status(status, StatusCode::PRECONDITION_FAILED, "form without items");
    assert_eq!(error_kind(&body), "precondition_failed");
    Ok(())
}

#[tokio::test]
async fn items_are_frozen_once_formed() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let op = app.seed_operation("Cholecystectomy", 0.1, 200).await?;
    let id = draft_with_item(&app, op, full_item_with_patient()).await?;

    app.request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;

    let (status, _, body) = app
        .request(
            Method::PATCH,
            &format!("/api/requests/{id}/items/{op}"),
            Some(&user),
            Some(json!({ "hb_after": 100 })),
        )
        .await?;
    assert_status(status, StatusCode::CONFLICT, "edit after form");
    assert_eq!(error_kind(&body), "invalid_state");

    // Patient metrics stay editable while formed.
    let (status, _, request) = app
        .request(
            Method::PATCH,
            &format!("/api/requests/{id}"),
            Some(&user),
            Some(json!({ "patient_weight_kg": 72 })),
        )
        .await?;
    assert_status(status, StatusCode::OK, "metrics while formed");
    assert_eq!(request["patient_weight_kg"], 72);
    assert_eq!(request["patient_height_cm"], 175.0);
    Ok(())
}

#[tokio::test]
async fn item_update_distinguishes_null_from_omitted() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let op = app.seed_operation("Thyroidectomy", 0.1, 200).await?;
    let id = draft_with_item(
        &app,
        op,
        json!({ "hb_before": 135, "total_blood_loss_ml": 500 }),
    )
    .await?;
    let path = format!("/api/requests/{id}/items/{op}");

    let (status, _, item) = app
        .request(
            Method::PATCH,
            &path,
            Some(&user),
            Some(json!({ "total_blood_loss_ml": null })),
        )
        .await?;
    assert_status(status, StatusCode::OK, "clear manual total");
    assert!(item["total_blood_loss_ml"].is_null());
    assert_eq!(item["hb_before"], 135);

    let (status, _, body) = app
        .request(Method::PATCH, &path, Some(&user), Some(json!({})))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "empty update");
    assert_eq!(error_kind(&body), "validation");
    Ok(())
}

#[tokio::test]
async fn duplicate_items_conflict() -> anyhow::Result<()> {
    let app = TestApp::new();
    let op = app.seed_operation("Mastectomy", 0.1, 200).await?;
    let id = draft_with_item(&app, op, json!({})).await?;

    let (status, _, body) = app
        .request(
            Method::POST,
            &format!("/api/requests/{id}/items/{op}"),
            Some(&app.user_token()),
            Some(json!({})),
        )
        .await?;
    assert_status(status, StatusCode::CONFLICT, "duplicate item");
    assert_eq!(error_kind(&body), "conflict");
    Ok(())
}

#[tokio::test]
async fn archived_operations_cannot_be_added() -> anyhow::Result<()> {
    let app = TestApp::new();
    let op = app.seed_operation("Obsolete", 0.1, 200).await?;
    let (status, _, archived) = app
        .request(
            Method::DELETE,
            &format!("/api/operations/{op}"),
            Some(&app.moderator_token()),
            None,
        )
        .await?;
    assert_status(status, StatusCode::OK, "archive");
    assert_eq!(archived["status"], "archived");

    let (status, _, _) = app
        .request(
            Method::POST,
            &format!("/api/operations/{op}/draft"),
            Some(&app.user_token()),
            Some(json!({})),
        )
        .await?;
    assert_status(status, StatusCode::NOT_FOUND, "add archived");
    Ok(())
}

#[tokio::test]
async fn ownership_and_roles_are_enforced() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let other = app.token(OTHER_USER, false);
    let op = app.seed_operation("Craniotomy", 0.1, 200).await?;
    let id = draft_with_item(&app, op, full_item_with_patient()).await?;

    let (status, _, _) = app
        .request(Method::GET, &format!("/api/requests/{id}"), Some(&other), None)
        .await?;
    assert_status(status, StatusCode::FORBIDDEN, "foreign detail");

    let (status, _, _) = app
        .request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&other), None)
        .await?;
    assert_status(status, StatusCode::FORBIDDEN, "foreign form");

    let (status, _, _) = app
        .request(
            Method::GET,
            &format!("/api/requests/{id}"),
            Some(&app.moderator_token()),
            None,
        )
        .await?;
    assert_status(status, StatusCode::OK, "moderator detail");

    app.request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    let (status, _, body) = app
        .request(
            Method::PUT,
            &format!("/api/requests/{id}/complete"),
            Some(&user),
            None,
        )
        .await?;
    assert_status(status, StatusCode::FORBIDDEN, "complete without role");
    assert_eq!(error_kind(&body), "forbidden");

    let (status, _, _) = app
        .request(
            Method::POST,
            "/api/operations",
            Some(&user),
            Some(json!({ "title": "x", "blood_loss_coeff": 0.1, "avg_blood_loss": 1 })),
        )
        .await?;
    assert_status(status, StatusCode::FORBIDDEN, "create operation without role");
    Ok(())
}

#[tokio::test]
async fn anonymous_callers_are_unauthorized() -> anyhow::Result<()> {
    let app = TestApp::new();

    let (status, headers, body) = app.request(Method::GET, "/api/requests", None, None).await?;
    assert_status(status, StatusCode::UNAUTHORIZED, "anonymous list");
    assert_eq!(headers["www-authenticate"], "Bearer");
    assert_eq!(error_kind(&body), "unauthorized");

    let (status, _, _) = app
        .request(Method::GET, "/api/requests", Some("not-a-jwt"), None)
        .await?;
    assert_status(status, StatusCode::UNAUTHORIZED, "garbage token");

    let (status, _, _) = app.request(Method::GET, "/api/operations", None, None).await?;
    assert_status(status, StatusCode::OK, "public catalog");
    Ok(())
}

#[tokio::test]
async fn logout_revokes_the_token() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();

    let (status, _, _) = app
        .request(Method::GET, "/api/requests/draft", Some(&user), None)
        .await?;
    assert_status(status, StatusCode::OK, "before logout");

    let (status, _, _) = app
        .request(Method::POST, "/api/auth/logout", Some(&user), None)
        .await?;
    assert_status(status, StatusCode::NO_CONTENT, "logout");

    let (status, _, body) = app
        .request(Method::GET, "/api/requests/draft", Some(&user), None)
        .await?;
    assert_status(status, StatusCode::UNAUTHORIZED, "after logout");
    assert!(body["error"]["message"].as_str().unwrap().contains("revoked"));
    Ok(())
}

#[tokio::test]
async fn listings_follow_role_and_filters() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let moderator = app.moderator_token();
    let op = app.seed_operation("Laparotomy", 0.1, 200).await?;
    let id = draft_with_item(&app, op, full_item_with_patient()).await?;

    let (_, _, own) = app
        .request(Method::GET, "/api/requests", Some(&user), None)
        .await?;
    assert_eq!(own.as_array().unwrap().len(), 1);

    let (_, _, foreign) = app
        .request(
            Method::GET,
            "/api/requests",
            Some(&app.token(OTHER_USER, false)),
            None,
        )
        .await?;
    assert!(foreign.as_array().unwrap().is_empty());

    // Drafts are invisible to moderators unless asked for.
    let (_, _, all) = app
        .request(Method::GET, "/api/requests", Some(&moderator), None)
        .await?;
    assert!(all.as_array().unwrap().is_empty());
    let (_, _, all) = app
        .request(
            Method::GET,
            "/api/requests?include_all=true",
            Some(&moderator),
            None,
        )
        .await?;
    assert_eq!(all.as_array().unwrap().len(), 1);

    app.request(Method::PUT, &format!("/api/requests/{id}/form"), Some(&user), None)
        .await?;
    let (_, _, formed) = app
        .request(Method::GET, "/api/requests?status=formed", Some(&moderator), None)
        .await?;
    assert_eq!(formed[0]["id"], id);

    let (_, _, ancient) = app
        .request(
            Method::GET,
            "/api/requests?date_to=2000-01-01",
            Some(&moderator),
            None,
        )
        .await?;
    assert!(ancient.as_array().unwrap().is_empty());

    let (status, _, body) = app
        .request(
            Method::GET,
            "/api/requests?date_from=yesterday",
            Some(&moderator),
            None,
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "malformed date");
    assert_eq!(error_kind(&body), "validation");
    Ok(())
}

#[tokio::test]
async fn delete_hides_the_request_and_frees_the_draft_slot() -> anyhow::Result<()> {
    let app = TestApp::new();
    let user = app.user_token();
    let op = app.seed_operation("Tonsillectomy", 0.1, 200).await?;
    let id = draft_with_item(&app, op, json!({})).await?;

    let (status, _, _) = app
        .request(Method::DELETE, &format!("/api/requests/{id}"), Some(&user), None)
        .await?;
    assert_status(status, StatusCode::NO_CONTENT, "delete");

    let (_, _, own) = app
        .request(Method::GET, "/api/requests", Some(&user), None)
        .await?;
    assert!(own.as_array().unwrap().is_empty());

    let (_, _, summary) = app
        .request(Method::GET, "/api/requests/draft", Some(&user), None)
        .await?;
    assert!(summary["current_request_id"].is_null());
    assert_eq!(summary["item_count"], 0);

    let next = draft_with_item(&app, op, json!({})).await?;
    assert_ne!(next, id);
    Ok(())
}

#[tokio::test]
async fn health_reports_request_ids_and_security_headers() -> anyhow::Result<()> {
    let app = TestApp::new();
    let (status, headers, body) = app.request(Method::GET, "/health", None, None).await?;
    assert_status(status, StatusCode::OK, "health");
    assert_eq!(body["status"], "ok");
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(headers["x-content-type-options"], "nosniff");
    Ok(())
}
