//! Surgical blood-loss estimation.
//!
//! Pure functions only: the Nadler blood-volume formula, the hemoglobin-drop
//! loss model scaled by surgery duration, and the coefficient × average
//! baseline used when per-patient measurements are unavailable.

#![forbid(unsafe_code)]

mod error;
mod nadler;

pub use error::{Error, Result};
pub use nadler::{blood_volume_ml, estimate, fallback_ml, round_ml, EstimateInput};
