//! Blood-loss estimation requests and their line items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use validator::Validate;

use super::{FieldUpdate, OperationId, RequestId, UserId};

/// Request lifecycle status.
///
/// `Draft → Formed → Completed`; `Deleted` is reachable from any state.
/// Neither `Completed` nor `Deleted` has outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Draft,
    Formed,
    Completed,
    Deleted,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Formed => "formed",
            RequestStatus::Completed => "completed",
            RequestStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Deleted)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RequestStatus::Draft),
            "formed" => Ok(RequestStatus::Formed),
            "completed" => Ok(RequestStatus::Completed),
            "deleted" => Ok(RequestStatus::Deleted),
            other => Err(format!("unknown request status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub status: RequestStatus,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    pub formed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub moderator_id: Option<UserId>,
    pub patient_height_cm: Option<f64>,
    pub patient_weight_kg: Option<i32>,
}

impl Request {
    pub fn patient(&self) -> PatientMetrics {
        PatientMetrics {
            height_cm: self.patient_height_cm,
            weight_kg: self.patient_weight_kg,
        }
    }
}

/// Patient anthropometrics; each field may be supplied independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct PatientMetrics {
    #[validate(range(exclusive_min = 0.0, max = 300.0))]
    pub height_cm: Option<f64>,
    #[validate(range(exclusive_min = 0, max = 700))]
    pub weight_kg: Option<i32>,
}

impl PatientMetrics {
    pub fn is_empty(&self) -> bool {
        self.height_cm.is_none() && self.weight_kg.is_none()
    }

    /// Overlay the provided fields of `update` onto `self`.
    pub fn merged(self, update: PatientMetrics) -> PatientMetrics {
        PatientMetrics {
            height_cm: update.height_cm.or(self.height_cm),
            weight_kg: update.weight_kg.or(self.weight_kg),
        }
    }

    /// Names of the fields still missing before the request can be formed.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.height_cm.is_none() {
            missing.push("patient_height_cm");
        }
        if self.weight_kg.is_none() {
            missing.push("patient_weight_kg");
        }
        missing
    }
}

/// Per-operation measurements. A present `total_blood_loss_ml` is a manual
/// override and is never recomputed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ItemMeasurements {
    #[validate(range(min = 0))]
    pub hb_before: Option<i32>,
    #[validate(range(min = 0))]
    pub hb_after: Option<i32>,
    #[validate(range(min = 0.0))]
    pub surgery_duration_hours: Option<f64>,
    #[validate(range(min = 0))]
    pub total_blood_loss_ml: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestItem {
    pub request_id: RequestId,
    pub operation_id: OperationId,
    #[serde(flatten)]
    pub measurements: ItemMeasurements,
}

/// Partial update of an item's measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ItemUpdate {
    #[serde(default)]
    pub hb_before: FieldUpdate<i32>,
    #[serde(default)]
    pub hb_after: FieldUpdate<i32>,
    #[serde(default)]
    pub surgery_duration_hours: FieldUpdate<f64>,
    #[serde(default)]
    pub total_blood_loss_ml: FieldUpdate<i32>,
}

impl ItemUpdate {
    pub fn is_empty(&self) -> bool {
        self.hb_before.is_keep()
            && self.hb_after.is_keep()
            && self.surgery_duration_hours.is_keep()
            && self.total_blood_loss_ml.is_keep()
    }

    pub fn apply_to(&self, current: ItemMeasurements) -> ItemMeasurements {
        ItemMeasurements {
            hb_before: self.hb_before.apply(current.hb_before),
            hb_after: self.hb_after.apply(current.hb_after),
            surgery_duration_hours: self
                .surgery_duration_hours
                .apply(current.surgery_duration_hours),
            total_blood_loss_ml: self.total_blood_loss_ml.apply(current.total_blood_loss_ml),
        }
    }

    /// Same bounds as [`ItemMeasurements`], checked on the values being set.
    pub fn check(&self) -> Result<(), String> {
        let set = ItemMeasurements {
            hb_before: self.hb_before.as_set().copied(),
            hb_after: self.hb_after.as_set().copied(),
            surgery_duration_hours: self.surgery_duration_hours.as_set().copied(),
            total_blood_loss_ml: self.total_blood_loss_ml.as_set().copied(),
        };
        set.validate().map_err(|e| e.to_string())
    }
}

/// Filters shared by both request listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub status: Option<RequestStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl ListFilter {
    /// Whether `at` falls inside the (inclusive) date window.
    pub fn in_window(&self, at: Option<DateTime<Utc>>) -> bool {
        if self.date_from.is_none() && self.date_to.is_none() {
            return true;
        }
        let Some(at) = at else {
            return false;
        };
        self.date_from.map_or(true, |from| at >= from) && self.date_to.map_or(true, |to| at <= to)
    }
}

/// Where an item's final blood-loss value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossSource {
    /// Manual override entered before completion.
    Manual,
    /// Nadler estimate from patient and item measurements.
    Estimated,
    /// `blood_loss_coeff × avg_blood_loss` baseline.
    Fallback,
}

impl LossSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossSource::Manual => "manual",
            LossSource::Estimated => "estimated",
            LossSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub operation_id: OperationId,
    pub total_blood_loss_ml: i32,
    pub source: LossSource,
}

/// Result of completing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: RequestId,
    /// Sum of the per-item rounded values.
    pub total_blood_loss_ml: i64,
    pub items: Vec<ItemOutcome>,
}

/// An item together with the operation data completion needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionItem {
    pub operation_id: OperationId,
    pub measurements: ItemMeasurements,
    pub blood_loss_coeff: f64,
    pub avg_blood_loss: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailItem {
    pub operation_id: OperationId,
    pub title: String,
    pub image_url: Option<String>,
    pub blood_loss_coeff: f64,
    pub avg_blood_loss: i32,
    #[serde(flatten)]
    pub measurements: ItemMeasurements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDetail {
    #[serde(flatten)]
    pub request: Request,
    pub items: Vec<DetailItem>,
    /// Items with a persisted total; only reported once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_count: Option<usize>,
}

/// The caller's open draft, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSummary {
    pub current_request_id: Option<RequestId>,
    pub item_count: i64,
}
