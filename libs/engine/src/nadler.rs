//! Nadler blood-volume estimate and the hemoglobin-drop loss model.

use crate::error::{Error, Result};

const NADLER_HEIGHT_FACTOR: f64 = 0.3669;
const NADLER_WEIGHT_FACTOR: f64 = 0.03219;
const NADLER_CONSTANT: f64 = 0.6041;
const ML_PER_LITRE: f64 = 1000.0;

/// Inputs for a single per-operation estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateInput {
    pub height_cm: f64,
    pub weight_kg: f64,
    /// Pre-operative hemoglobin (g/L or g/dL; only the ratio matters).
    pub hb_before: i32,
    /// Post-operative hemoglobin, same unit as `hb_before`.
    pub hb_after: i32,
    pub duration_hours: f64,
    /// Operation bleeding coefficient, used as a per-hour time multiplier.
    pub coeff: f64,
}

/// Estimated total blood volume in mL (Nadler formula).
///
/// Height is given in centimetres and converted to metres before cubing.
pub fn blood_volume_ml(height_cm: f64, weight_kg: f64) -> f64 {
    let height_m = height_cm / 100.0;
    (NADLER_HEIGHT_FACTOR * height_m.powi(3) + NADLER_WEIGHT_FACTOR * weight_kg + NADLER_CONSTANT)
        * ML_PER_LITRE
}

/// Estimate blood loss for one operation, rounded to whole millilitres.
///
/// `round(BV × (hbBefore − hbAfter) / hbBefore × (1 + coeff × duration))`
pub fn estimate(input: &EstimateInput) -> Result<i32> {
    validate(input)?;

    let volume = blood_volume_ml(input.height_cm, input.weight_kg);
    let before = f64::from(input.hb_before);
    let drop = (before - f64::from(input.hb_after)) / before;
    let base = volume * drop;
    let factor = 1.0 + input.coeff * input.duration_hours;

    let total = (base * factor).round();
    if !total.is_finite() || total > f64::from(i32::MAX) {
        return Err(Error::OutOfRange(total));
    }
    Ok(total as i32)
}

/// Baseline used when measurements are missing or rejected: `round(coeff × avg)`.
///
/// Never fails; the product is clamped into `0..=i32::MAX`.
pub fn fallback_ml(coeff: f64, avg_blood_loss: i32) -> i32 {
    round_ml(coeff * f64::from(avg_blood_loss))
}

/// Round half away from zero and saturate into the non-negative `i32` range.
pub fn round_ml(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let rounded = value.round();
    if rounded <= 0.0 {
        0
    } else if rounded >= f64::from(i32::MAX) {
        i32::MAX
    } else {
        rounded as i32
    }
}

fn validate(input: &EstimateInput) -> Result<()> {
    finite("height_cm", input.height_cm)?;
    finite("weight_kg", input.weight_kg)?;
    finite("surgery_duration_hours", input.duration_hours)?;
    finite("blood_loss_coeff", input.coeff)?;

    if input.height_cm <= 0.0 {
        return Err(Error::NonPositiveHeight(input.height_cm));
    }
    if input.weight_kg <= 0.0 {
        return Err(Error::NonPositiveWeight(input.weight_kg));
    }
    if input.hb_before <= 0 {
        return Err(Error::NonPositiveHbBefore(input.hb_before));
    }
    if input.hb_after < 0 {
        return Err(Error::NegativeHbAfter(input.hb_after));
    }
    if input.hb_after >= input.hb_before {
        return Err(Error::HbNotDecreased {
            before: input.hb_before,
            after: input.hb_after,
        });
    }
    if input.duration_hours < 0.0 {
        return Err(Error::NegativeDuration(input.duration_hours));
    }
    if input.coeff < 0.0 {
        return Err(Error::NegativeCoefficient(input.coeff));
    }
    Ok(())
}

fn finite(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::NotFinite { field, value })
    }
}
