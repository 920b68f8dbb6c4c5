//! Per-vehicle deviation report.
//!
//! Summarizes match results into mean and spread of window deviations, the
//! share of windows spent on route and a letter grade, and optionally
//! uploads the JSON to S3.

pub mod aggregate;
pub mod grade;
pub mod s3;
pub mod types;
pub mod utility;

pub use aggregate::build_report;
pub use grade::Grade;
pub use types::{DeviationReport, ReportIndex, ReportIndexEntry, VehicleSummary};
