use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Rejected estimator input.
///
/// Every variant carries the offending value(s) so callers can report which
/// measurement was out of range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("patient height must be positive, got {0} cm")]
    NonPositiveHeight(f64),

    #[error("patient weight must be positive, got {0} kg")]
    NonPositiveWeight(f64),

    #[error("pre-operative hemoglobin must be positive, got {0}")]
    NonPositiveHbBefore(i32),

    #[error("post-operative hemoglobin must not be negative, got {0}")]
    NegativeHbAfter(i32),

    #[error("post-operative hemoglobin ({after}) must be lower than pre-operative ({before})")]
    HbNotDecreased { before: i32, after: i32 },

    #[error("surgery duration must not be negative, got {0} h")]
    NegativeDuration(f64),

    #[error("bleeding coefficient must not be negative, got {0}")]
    NegativeCoefficient(f64),

    #[error("estimated blood loss {0} mL is out of range")]
    OutOfRange(f64),
}

impl Error {
    /// Name of the input the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            Error::NotFinite { field, .. } => field,
            Error::NonPositiveHeight(_) => "height_cm",
            Error::NonPositiveWeight(_) => "weight_kg",
            Error::NonPositiveHbBefore(_) => "hb_before",
            Error::NegativeHbAfter(_) | Error::HbNotDecreased { .. } => "hb_after",
            Error::NegativeDuration(_) => "surgery_duration_hours",
            Error::NegativeCoefficient(_) => "blood_loss_coeff",
            Error::OutOfRange(_) => "total_blood_loss_ml",
        }
    }
}
