//! Financial reports: tree model, date ranges, fallback retrieval, flattening

pub mod dates;
pub mod fallback;
pub mod flatten;
pub mod tree;

pub use fallback::{FallbackChain, FallbackOutcome, ReportRequest};
pub use flatten::{flatten, headers_for};
pub use tree::{ReportHeader, ReportKind, ReportRow, ReportTree};
