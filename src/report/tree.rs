//! Report tree model
//!
//! Financial reports arrive as nested sections with no schema shared across
//! report types. They are modelled as a closed set of row variants.

use crate::error::LedgerError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reports the pipeline knows by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    ProfitAndLoss,
    BalanceSheet,
    CashFlow,
    TrialBalance,
    GeneralLedger,
    AgedReceivables,
    AgedPayables,
}

impl ReportKind {
    pub const ALL: [ReportKind; 7] = [
        ReportKind::ProfitAndLoss,
        ReportKind::BalanceSheet,
        ReportKind::CashFlow,
        ReportKind::TrialBalance,
        ReportKind::GeneralLedger,
        ReportKind::AgedReceivables,
        ReportKind::AgedPayables,
    ];

    /// Endpoint name on the accounting API
    pub fn api_name(&self) -> &'static str {
        match self {
            ReportKind::ProfitAndLoss => "ProfitAndLoss",
            ReportKind::BalanceSheet => "BalanceSheet",
            ReportKind::CashFlow => "CashFlow",
            ReportKind::TrialBalance => "TrialBalance",
            ReportKind::GeneralLedger => "GeneralLedger",
            ReportKind::AgedReceivables => "AgedReceivables",
            ReportKind::AgedPayables => "AgedPayables",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ReportKind::ProfitAndLoss => "Profit and Loss",
            ReportKind::BalanceSheet => "Balance Sheet",
            ReportKind::CashFlow => "Cash Flow",
            ReportKind::TrialBalance => "Trial Balance",
            ReportKind::GeneralLedger => "General Ledger",
            ReportKind::AgedReceivables => "Aged Receivables",
            ReportKind::AgedPayables => "Aged Payables",
        }
    }

    /// Resolve an API name, title, or common alias. Matching ignores case,
    /// spaces, and punctuation.
    pub fn parse(name: &str) -> Option<ReportKind> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '&')
            .collect::<String>()
            .to_lowercase();

        let kind = match key.as_str() {
            "profitandloss" | "profitloss" | "p&l" | "pl" | "pnl" | "profit&loss"
            | "incomestatement" | "income" => ReportKind::ProfitAndLoss,
            "balancesheet" | "balance" => ReportKind::BalanceSheet,
            "cashflow" | "cashflows" | "statementofcashflows" => ReportKind::CashFlow,
            "trialbalance" => ReportKind::TrialBalance,
            "generalledger" | "ledger" | "gl" => ReportKind::GeneralLedger,
            "agedreceivables" | "agedreceivable" | "receivables" | "araging" => {
                ReportKind::AgedReceivables
            }
            "agedpayables" | "agedpayable" | "payables" | "apaging" => ReportKind::AgedPayables,
            _ => return None,
        };
        Some(kind)
    }

    /// Find a report mentioned anywhere in free text
    pub fn detect(text: &str) -> Option<ReportKind> {
        let lowered = text.to_lowercase();
        let phrases: &[(&str, ReportKind)] = &[
            ("profit and loss", ReportKind::ProfitAndLoss),
            ("profit & loss", ReportKind::ProfitAndLoss),
            ("p&l", ReportKind::ProfitAndLoss),
            ("income statement", ReportKind::ProfitAndLoss),
            ("balance sheet", ReportKind::BalanceSheet),
            ("cash flow", ReportKind::CashFlow),
            ("trial balance", ReportKind::TrialBalance),
            ("general ledger", ReportKind::GeneralLedger),
            ("aged receivable", ReportKind::AgedReceivables),
            ("aged payable", ReportKind::AgedPayables),
        ];
        phrases
            .iter()
            .find(|(phrase, _)| lowered.contains(phrase))
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub report_name: String,
    pub start_period: Option<String>,
    pub end_period: Option<String>,
    pub currency: Option<String>,
    pub basis: Option<String>,
    /// Strategy that produced the tree
    pub source: Option<String>,
    /// Remediation or caveat text for degraded results
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReportRow {
    Section {
        header: Option<Vec<String>>,
        rows: Vec<ReportRow>,
    },
    Data {
        cells: Vec<String>,
        #[serde(default)]
        placeholder: bool,
    },
    Summary {
        cells: Vec<String>,
    },
}

impl ReportRow {
    pub fn data<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReportRow::Data {
            cells: cells.into_iter().map(Into::into).collect(),
            placeholder: false,
        }
    }

    pub fn placeholder<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReportRow::Data {
            cells: cells.into_iter().map(Into::into).collect(),
            placeholder: true,
        }
    }

    pub fn summary<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReportRow::Summary {
            cells: cells.into_iter().map(Into::into).collect(),
        }
    }

    /// Data rows that carry real values, counted through nested sections
    fn real_data_rows(&self) -> usize {
        match self {
            ReportRow::Section { rows, .. } => rows.iter().map(ReportRow::real_data_rows).sum(),
            ReportRow::Data { cells, placeholder } => {
                usize::from(!*placeholder && cells.iter().any(|c| !c.trim().is_empty()))
            }
            ReportRow::Summary { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTree {
    pub header: ReportHeader,
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl ReportTree {
    /// Structurally valid: the header names a report. Column metadata is
    /// optional; `headers_for` supplies a default.
    pub fn is_well_formed(&self) -> bool {
        !self.header.report_name.trim().is_empty()
    }

    pub fn real_data_rows(&self) -> usize {
        self.rows.iter().map(ReportRow::real_data_rows).sum()
    }

    /// Parse the accounting API's report JSON.
    ///
    /// Fails with `MalformedResponse` when `Header` or `Rows` is absent.
    /// Rows of unknown shape are dropped.
    pub fn from_json(body: &Value) -> Result<ReportTree> {
        let header = body.get("Header").ok_or_else(|| {
            LedgerError::MalformedResponse("report has no Header".to_string())
        })?;
        let rows = body.get("Rows").ok_or_else(|| {
            LedgerError::MalformedResponse("report has no Rows".to_string())
        })?;

        let text = |key: &str| header.get(key).and_then(Value::as_str).map(str::to_string);

        let header = ReportHeader {
            report_name: text("ReportName").unwrap_or_default(),
            start_period: text("StartPeriod"),
            end_period: text("EndPeriod"),
            currency: text("Currency"),
            basis: text("ReportBasis"),
            source: None,
            note: None,
        };

        let columns = body
            .pointer("/Columns/Column")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .map(|c| {
                        let title = c.get("ColTitle").and_then(Value::as_str).unwrap_or("");
                        if title.trim().is_empty() {
                            c.get("ColType").and_then(Value::as_str).unwrap_or("").to_string()
                        } else {
                            title.to_string()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ReportTree {
            header,
            columns,
            rows: parse_rows(rows),
        })
    }
}

fn parse_rows(rows: &Value) -> Vec<ReportRow> {
    rows.get("Row")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_row).collect())
        .unwrap_or_default()
}

fn col_data(node: Option<&Value>) -> Option<Vec<String>> {
    let cells = node?.get("ColData")?.as_array()?;
    Some(
        cells
            .iter()
            .map(|c| match c.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect(),
    )
}

fn parse_row(node: &Value) -> Option<ReportRow> {
    let row_type = node.get("type").and_then(Value::as_str).unwrap_or("");

    let is_section = row_type.eq_ignore_ascii_case("section")
        || node.get("Rows").is_some()
        || node.get("Header").is_some();

    if is_section {
        let header = col_data(node.get("Header"));
        let mut children = node.get("Rows").map(parse_rows).unwrap_or_default();
        if let Some(summary) = col_data(node.get("Summary")) {
            children.push(ReportRow::Summary { cells: summary });
        }
        if header.is_none() && children.is_empty() {
            return None;
        }
        return Some(ReportRow::Section {
            header,
            rows: children,
        });
    }

    if let Some(cells) = col_data(Some(node)) {
        return Some(ReportRow::Data {
            cells,
            placeholder: false,
        });
    }

    col_data(node.get("Summary")).map(|cells| ReportRow::Summary { cells })
}
