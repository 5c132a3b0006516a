//! Request lifecycle handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

use crate::{
    api::extractors::{ApiJson, ApiQuery},
    auth::{Authenticated, Moderator},
    models::{ListFilter, PatientMetrics, RequestId, RequestStatus},
    state::AppState,
    Error, Result,
};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<RequestStatus>,
    /// `YYYY-MM-DD`, inclusive.
    pub date_from: Option<String>,
    /// `YYYY-MM-DD`, inclusive.
    pub date_to: Option<String>,
    #[serde(default)]
    pub include_all: bool,
}

impl ListQuery {
    pub fn to_filter(&self) -> Result<ListFilter> {
        let date_from = self
            .date_from
            .as_deref()
            .map(|raw| parse_day("date_from", raw).map(start_of_day))
            .transpose()?;
        let date_to = self
            .date_to
            .as_deref()
            .map(|raw| parse_day("date_to", raw).map(end_of_day))
            .transpose()?;

        if let (Some(from), Some(to)) = (date_from, date_to) {
            if from > to {
                return Err(Error::Validation(
                    "date_from must not be after date_to".to_string(),
                ));
            }
        }

        Ok(ListFilter {
            status: self.status,
            date_from,
            date_to,
        })
    }
}

fn parse_day(field: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| Error::Validation(format!("{field}: expected YYYY-MM-DD, got '{raw}'")))
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    start_of_day(day) + chrono::Duration::days(1) - chrono::Duration::microseconds(1)
}

/// Patient metrics as sent by clients; keys match the request resource.
#[derive(Debug, Default, Deserialize)]
pub struct PatientMetricsBody {
    pub patient_height_cm: Option<f64>,
    pub patient_weight_kg: Option<i32>,
}

impl From<PatientMetricsBody> for PatientMetrics {
    fn from(body: PatientMetricsBody) -> Self {
        PatientMetrics {
            height_cm: body.patient_height_cm,
            weight_kg: body.patient_weight_kg,
        }
    }
}

/// Moderators see every formed request (or everything with `include_all`);
/// other users see their own.
pub async fn list_requests(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<impl IntoResponse> {
    let filter = query.to_filter()?;
    let requests = if identity.is_moderator {
        state.lifecycle.list_all(&filter, query.include_all).await?
    } else {
        state
            .lifecycle
            .list_for_user(identity.user_id, &filter)
            .await?
    };
    Ok(Json(requests))
}

pub async fn draft_summary(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> Result<impl IntoResponse> {
    let summary = state.lifecycle.draft_summary(identity.user_id).await?;
    Ok(Json(summary))
}

pub async fn get_request(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse> {
    let detail = state.lifecycle.detail(id, identity.caller()).await?;
    Ok(Json(detail))
}

pub async fn update_patient_metrics(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<RequestId>,
    ApiJson(body): ApiJson<PatientMetricsBody>,
) -> Result<impl IntoResponse> {
    let request = state
        .lifecycle
        .set_patient_metrics(id, identity.caller(), body.into())
        .await?;
    Ok(Json(request))
}

pub async fn form_request(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse> {
    let request = state.lifecycle.form(id, identity.user_id).await?;
    Ok(Json(request))
}

pub async fn complete_request(
    State(state): State<AppState>,
    Moderator(identity): Moderator,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse> {
    let completion = state.lifecycle.complete(id, identity.user_id).await?;
    Ok(Json(completion))
}

pub async fn delete_request(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<RequestId>,
) -> Result<impl IntoResponse> {
    state.lifecycle.delete(id, identity.caller()).await?;
    Ok(StatusCode::NO_CONTENT)
}
