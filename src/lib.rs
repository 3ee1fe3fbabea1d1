//! ledgerflow
//!
//! Natural-language bookkeeping assistant:
//! - Resolves free-text requests into validated intents (oracle + normalizer)
//! - Fetches accounting reports through a multi-tier fallback chain
//! - Flattens hierarchical reports and record lists into tables
//! - Writes results to a spreadsheet-like sink
//! - Refreshes OAuth tokens at most once per failed call
//!
//! PIPELINE:
//! QUERY → ORACLE → NORMALIZE → DISPATCH → (REPORT | QUERY | SHEET) → RESPONSE

pub mod accounting;
pub mod agent;
pub mod api;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod formatter;
pub mod gemini;
pub mod intent;
pub mod memory;
pub mod models;
pub mod report;
pub mod sink;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::Assistant;
pub use error::LedgerError;
