//! Surgical operation catalog entries

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use validator::Validate;

use super::{FieldUpdate, OperationId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Active,
    Archived,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Active => "active",
            OperationStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OperationStatus::Active),
            "archived" => Ok(OperationStatus::Archived),
            other => Err(format!("unknown operation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub title: String,
    pub description: Option<String>,
    pub status: OperationStatus,
    pub image_url: Option<String>,
    /// Bleeding coefficient per hour of surgery.
    pub blood_loss_coeff: f64,
    /// Typical blood loss for this operation, in mL.
    pub avg_blood_loss: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct NewOperation {
    #[validate(length(min = 1, max = 64))]
    pub title: String,
    pub description: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
    #[validate(range(min = 0.0))]
    pub blood_loss_coeff: f64,
    #[validate(range(min = 0))]
    pub avg_blood_loss: i32,
}

/// Partial update of a catalog entry. Nullable text fields accept `null`
/// to clear them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Validate)]
pub struct OperationPatch {
    #[validate(length(min = 1, max = 64))]
    pub title: Option<String>,
    #[serde(default)]
    pub description: FieldUpdate<String>,
    #[serde(default)]
    pub image_url: FieldUpdate<String>,
    #[validate(range(min = 0.0))]
    pub blood_loss_coeff: Option<f64>,
    #[validate(range(min = 0))]
    pub avg_blood_loss: Option<i32>,
    pub status: Option<OperationStatus>,
}

impl OperationPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_keep()
            && self.image_url.is_keep()
            && self.blood_loss_coeff.is_none()
            && self.avg_blood_loss.is_none()
            && self.status.is_none()
    }

    pub fn apply_to(&self, current: Operation) -> Operation {
        Operation {
            id: current.id,
            title: self.title.clone().unwrap_or(current.title),
            description: self.description.clone().apply(current.description),
            status: self.status.unwrap_or(current.status),
            image_url: self.image_url.clone().apply(current.image_url),
            blood_loss_coeff: self.blood_loss_coeff.unwrap_or(current.blood_loss_coeff),
            avg_blood_loss: self.avg_blood_loss.unwrap_or(current.avg_blood_loss),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationFilter {
    /// Case-insensitive substring match on the title.
    pub title: Option<String>,
    pub status: Option<OperationStatus>,
}

impl OperationFilter {
    pub fn matches(&self, operation: &Operation) -> bool {
        if let Some(status) = self.status {
            if operation.status != status {
                return false;
            }
        }
        match &self.title {
            Some(needle) if !needle.is_empty() => operation
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}
