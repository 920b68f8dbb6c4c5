//! Domain errors raised by the cleaning, grouping and matching stages.
//!
//! An off-route segment is not an error: the matcher reports it as an
//! unmatched [`MatchResult`](crate::matcher::MatchResult).

use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input, or nothing left to analyze after cleaning.
    #[error("validation failed{}: {reason}", scope(.vehicle_id, .date))]
    Validation {
        vehicle_id: Option<String>,
        date: Option<NaiveDate>,
        reason: String,
    },

    /// Structurally invalid reference data, e.g. no candidate route variants.
    #[error("invalid input: {0}")]
    Input(String),
}

impl PipelineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        PipelineError::Validation {
            vehicle_id: None,
            date: None,
            reason: reason.into(),
        }
    }

    pub fn input(reason: impl Into<String>) -> Self {
        PipelineError::Input(reason.into())
    }

    /// Attaches the vehicle and date being processed, keeping any scope that
    /// is already set.
    pub fn scoped(self, vehicle: &str, day: Option<NaiveDate>) -> Self {
        match self {
            PipelineError::Validation {
                vehicle_id,
                date,
                reason,
            } => PipelineError::Validation {
                vehicle_id: vehicle_id.or_else(|| Some(vehicle.to_string())),
                date: date.or(day),
                reason,
            },
            other => other,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation { .. })
    }
}

fn scope(vehicle_id: &Option<String>, date: &Option<NaiveDate>) -> String {
    match (vehicle_id, date) {
        (Some(v), Some(d)) => format!(" for vehicle {v} on {d}"),
        (Some(v), None) => format!(" for vehicle {v}"),
        (None, Some(d)) => format!(" on {d}"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_includes_scope() {
        let err = PipelineError::validation("no records left after cleaning")
            .scoped("0050034", NaiveDate::from_ymd_opt(2023, 9, 12));

        let msg = err.to_string();
        assert!(msg.contains("0050034"));
        assert!(msg.contains("2023-09-12"));
        assert!(msg.contains("no records left"));
    }

    #[test]
    fn test_scoped_keeps_existing_vehicle() {
        let err = PipelineError::Validation {
            vehicle_id: Some("A".to_string()),
            date: None,
            reason: "bad".to_string(),
        }
        .scoped("B", None);

        assert!(err.to_string().contains("vehicle A"));
    }

    #[test]
    fn test_input_error_is_not_validation() {
        let err = PipelineError::input("no candidate route variants");
        assert!(!err.is_validation());
        assert_eq!(err.to_string(), "invalid input: no candidate route variants");
    }
}
