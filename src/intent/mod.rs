//! Intent resolution: NLU oracles and the normalizer that validates their output

pub mod normalizer;
pub mod oracle;

pub use normalizer::normalize;
pub use oracle::{GeminiOracle, KeywordOracle, NluOracle};

/// Action vocabulary advertised to the oracle
pub const AVAILABLE_ACTIONS: [&str; 10] = [
    "fetch/report: run a financial report (ProfitAndLoss, BalanceSheet, CashFlow, ...)",
    "fetch/query: list records of an entity (Customer, Invoice, Vendor, ...)",
    "fetch/entity: fetch one record by id",
    "create/createArtifact: create a new sheet",
    "modify/addRow: append a row to a sheet",
    "modify/clearRange: clear a range",
    "modify/updateDestination: write values to a range",
    "help: list what the assistant can do",
    "diagnostic: test the accounting connection",
    "custom: call an accounting API path directly",
];
