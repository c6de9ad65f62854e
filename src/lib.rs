//! Retrospective order analytics for an e-commerce shop.
//!
//! A run ingests a raw order export, enriches and numbers it against the
//! persisted history, rewrites the history, and renders an XLSX report with
//! purchase-path diagrams alongside.

pub mod basket;
pub mod catalog;
pub mod config;
pub mod enrich;
pub mod error;
pub mod history;
pub mod ingest;
pub mod model;
pub mod path;
pub mod pattern;
pub mod pipeline;
pub mod rebuy;
pub mod report;
pub mod schema;
pub mod segment;
pub mod sequence;
pub mod table;
pub mod telemetry;

#[cfg(feature = "python")]
mod python;

pub use error::{InsightError, Result};
pub use pipeline::{run, OrderAnalytics, RunSummary};
