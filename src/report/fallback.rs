//! Report fallback chain
//!
//! Strategies run in order, each cruder than the last, until one yields at
//! least one real data row. Each strategy reports a tri-state outcome
//! (data / empty / failed) instead of raising. When every strategy comes up
//! short the chain returns a valid skeleton report, so callers always get a
//! structurally sound tree.

use super::dates::{resolve_range, DateRange};
use super::tree::{ReportHeader, ReportKind, ReportRow, ReportTree};
use crate::accounting::AccountingApi;
use crate::config::RetryConfig;
use crate::error::LedgerError;
use crate::models::FallbackAttempt;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SKELETON_STRATEGY: &str = "skeleton";
pub const UNAVAILABLE_LABEL: &str = "Data Unavailable";

const INCOME_SOURCES: [&str; 3] = ["Invoice", "SalesReceipt", "Deposit"];
const EXPENSE_SOURCES: [&str; 3] = ["Bill", "Purchase", "Expense"];
const TRANSACTION_PAGE: u32 = 1000;

/// What the caller asked for, before date normalization
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub kind: ReportKind,
    pub start_date: String,
    pub end_date: String,
    pub accounting_method: String,
    pub summarize_by: String,
}

impl ReportRequest {
    pub fn new(kind: ReportKind, start_date: impl Into<String>, end_date: impl Into<String>) -> Self {
        Self {
            kind,
            start_date: start_date.into(),
            end_date: end_date.into(),
            accounting_method: "Accrual".to_string(),
            summarize_by: "Total".to_string(),
        }
    }
}

/// A request with its dates resolved to a concrete range
#[derive(Debug, Clone)]
pub struct ResolvedReport {
    pub kind: ReportKind,
    pub range: DateRange,
    pub accounting_method: String,
    pub summarize_by: String,
}

pub enum StrategyOutcome {
    Data(ReportTree),
    Empty(String),
    Failed(LedgerError),
}

#[async_trait]
pub trait ReportStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, api: &dyn AccountingApi, request: &ResolvedReport) -> StrategyOutcome;
}

#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub tree: ReportTree,
    pub strategy: String,
    pub attempts: Vec<FallbackAttempt>,
    /// Input dates were malformed and the full current year was used
    pub dates_defaulted: bool,
}

impl FallbackOutcome {
    pub fn degraded(&self) -> bool {
        self.attempts.first().map(|a| !a.success).unwrap_or(false)
    }
}

pub struct FallbackChain {
    api: Arc<dyn AccountingApi>,
    strategies: Vec<Box<dyn ReportStrategy>>,
}

impl FallbackChain {
    /// Direct endpoint, then account balances, then transaction sums
    pub fn new(api: Arc<dyn AccountingApi>, retry: RetryConfig) -> Self {
        Self::with_strategies(
            api,
            vec![
                Box::new(DirectReportStrategy { retry }),
                Box::new(AccountBalanceStrategy),
                Box::new(TransactionAggregationStrategy),
            ],
        )
    }

    pub fn with_strategies(
        api: Arc<dyn AccountingApi>,
        strategies: Vec<Box<dyn ReportStrategy>>,
    ) -> Self {
        Self { api, strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn fetch(&self, request: &ReportRequest, today: NaiveDate) -> FallbackOutcome {
        let (range, dates_defaulted) = resolve_range(&request.start_date, &request.end_date, today);
        if dates_defaulted {
            warn!(
                start = %request.start_date,
                end = %request.end_date,
                "Malformed report dates; using full current year"
            );
        }

        let resolved = ResolvedReport {
            kind: request.kind,
            range,
            accounting_method: request.accounting_method.clone(),
            summarize_by: request.summarize_by.clone(),
        };

        let mut attempts = Vec::with_capacity(self.strategies.len() + 1);
        let mut last_error: Option<LedgerError> = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            debug!(strategy = name, report = %resolved.kind, "Trying report strategy");

            match strategy.attempt(self.api.as_ref(), &resolved).await {
                StrategyOutcome::Data(mut tree) => {
                    if !tree.is_well_formed() {
                        attempts.push(failed_attempt(name, "structurally invalid report"));
                        continue;
                    }
                    if tree.real_data_rows() == 0 {
                        attempts.push(failed_attempt(name, "no data rows"));
                        continue;
                    }

                    info!(strategy = name, report = %resolved.kind, "Report strategy succeeded");
                    attempts.push(FallbackAttempt {
                        strategy: name.to_string(),
                        success: true,
                        detail: None,
                    });
                    annotate(&mut tree, name, &resolved);
                    if dates_defaulted {
                        append_note(&mut tree, "Requested dates were invalid; showing the full current year.");
                    }
                    return FallbackOutcome {
                        tree,
                        strategy: name.to_string(),
                        attempts,
                        dates_defaulted,
                    };
                }
                StrategyOutcome::Empty(reason) => {
                    debug!(strategy = name, %reason, "Report strategy returned nothing");
                    attempts.push(failed_attempt(name, &reason));
                }
                StrategyOutcome::Failed(e) if e.advances_fallback() => {
                    warn!(strategy = name, error = %e, "Report strategy failed");
                    attempts.push(failed_attempt(name, &e.to_string()));
                    if last_error.as_ref().map_or(true, LedgerError::advances_fallback) {
                        last_error = Some(e);
                    }
                }
                StrategyOutcome::Failed(e) => {
                    // Credential and validation failures outrank scope errors
                    // when choosing the skeleton's remediation note.
                    error!(strategy = name, error = %e, "Report strategy failed outside fallback policy");
                    attempts.push(failed_attempt(name, &format!("{} ({})", e, e.kind())));
                    last_error = Some(e);
                }
            }
        }

        warn!(report = %resolved.kind, "All report strategies exhausted; returning skeleton");
        attempts.push(FallbackAttempt {
            strategy: SKELETON_STRATEGY.to_string(),
            success: true,
            detail: last_error.as_ref().map(|e| e.kind().to_string()),
        });

        FallbackOutcome {
            tree: skeleton(&resolved, last_error.as_ref()),
            strategy: SKELETON_STRATEGY.to_string(),
            attempts,
            dates_defaulted,
        }
    }
}

fn failed_attempt(name: &str, detail: &str) -> FallbackAttempt {
    FallbackAttempt {
        strategy: name.to_string(),
        success: false,
        detail: Some(detail.to_string()),
    }
}

fn annotate(tree: &mut ReportTree, source: &str, request: &ResolvedReport) {
    if tree.header.report_name.trim().is_empty() {
        tree.header.report_name = request.kind.api_name().to_string();
    }
    tree.header.start_period.get_or_insert_with(|| request.range.start_str());
    tree.header.end_period.get_or_insert_with(|| request.range.end_str());
    tree.header.source = Some(source.to_string());
}

fn append_note(tree: &mut ReportTree, note: &str) {
    tree.header.note = Some(match tree.header.note.take() {
        Some(existing) => format!("{} {}", existing, note),
        None => note.to_string(),
    });
}

/// Remediation text matched to the failure that ended the chain
fn remediation(error: Option<&LedgerError>) -> &'static str {
    match error {
        Some(LedgerError::AuthRequired(_)) => {
            "Connect your accounting account, then run the request again."
        }
        Some(LedgerError::AuthExpired(_)) | Some(LedgerError::Unauthorized(_)) => {
            "Your session expired. Reconnect your accounting account and retry."
        }
        Some(LedgerError::PermissionDenied(_)) => {
            "Reconnect with admin credentials to grant report access."
        }
        Some(LedgerError::TransientNetwork(_)) => {
            "The accounting service is unreachable. Try again in a few minutes."
        }
        _ => "No data was found for this period. Check the date range or reconnect with admin credentials.",
    }
}

fn skeleton(request: &ResolvedReport, error: Option<&LedgerError>) -> ReportTree {
    let note = remediation(error);
    ReportTree {
        header: ReportHeader {
            report_name: request.kind.api_name().to_string(),
            start_period: Some(request.range.start_str()),
            end_period: Some(request.range.end_str()),
            currency: None,
            basis: None,
            source: Some(SKELETON_STRATEGY.to_string()),
            note: Some(note.to_string()),
        },
        columns: vec!["Account".to_string(), "Total".to_string()],
        rows: vec![ReportRow::placeholder([UNAVAILABLE_LABEL, note])],
    }
}

//
// ================= Money =================
//

/// Read a monetary amount from a JSON number or numeric string
pub fn amount(value: Option<&Value>) -> Decimal {
    let text = match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        _ => return Decimal::ZERO,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .unwrap_or(Decimal::ZERO)
}

pub fn money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp(2))
}

//
// ================= Strategy 1: direct report endpoint =================
//

pub struct DirectReportStrategy {
    pub retry: RetryConfig,
}

#[async_trait]
impl ReportStrategy for DirectReportStrategy {
    fn name(&self) -> &'static str {
        "direct_report"
    }

    async fn attempt(&self, api: &dyn AccountingApi, request: &ResolvedReport) -> StrategyOutcome {
        let params = vec![
            ("start_date".to_string(), request.range.start_str()),
            ("end_date".to_string(), request.range.end_str()),
            ("accounting_method".to_string(), request.accounting_method.clone()),
            ("summarize_column_by".to_string(), request.summarize_by.clone()),
        ];

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match api.report(request.kind.api_name(), &params).await {
                Ok(body) => {
                    return match ReportTree::from_json(&body) {
                        Ok(mut tree) => {
                            if tree.header.report_name.trim().is_empty() {
                                tree.header.report_name = request.kind.api_name().to_string();
                            }
                            StrategyOutcome::Data(tree)
                        }
                        Err(e) => StrategyOutcome::Failed(e),
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient report failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return StrategyOutcome::Failed(e),
            }
        }
    }
}

//
// ================= Strategy 2: account balance aggregation =================
//

struct AccountGroup {
    classification: &'static str,
    /// Whether the group's total is added to or subtracted from the net line
    positive: bool,
}

pub struct AccountBalanceStrategy;

impl AccountBalanceStrategy {
    fn groups(kind: ReportKind) -> Option<(&'static [AccountGroup], &'static str)> {
        static PNL: [AccountGroup; 2] = [
            AccountGroup { classification: "Revenue", positive: true },
            AccountGroup { classification: "Expense", positive: false },
        ];
        static BALANCE: [AccountGroup; 2] = [
            AccountGroup { classification: "Asset", positive: true },
            AccountGroup { classification: "Liability", positive: false },
        ];
        match kind {
            ReportKind::ProfitAndLoss => Some((&PNL[..], "Net Income")),
            ReportKind::BalanceSheet => Some((&BALANCE[..], "Net Assets")),
            _ => None,
        }
    }
}

#[async_trait]
impl ReportStrategy for AccountBalanceStrategy {
    fn name(&self) -> &'static str {
        "account_balances"
    }

    async fn attempt(&self, api: &dyn AccountingApi, request: &ResolvedReport) -> StrategyOutcome {
        let Some((groups, net_label)) = Self::groups(request.kind) else {
            return StrategyOutcome::Empty(format!(
                "{} cannot be rebuilt from account balances",
                request.kind
            ));
        };

        let mut rows = Vec::new();
        let mut net = Decimal::ZERO;

        for group in groups {
            let statement = format!(
                "SELECT * FROM Account WHERE Classification = '{}'",
                group.classification
            );
            let accounts = match api.query(&statement).await {
                Ok(accounts) => accounts,
                Err(e) => return StrategyOutcome::Failed(e),
            };

            for account in &accounts {
                let name = account
                    .get("FullyQualifiedName")
                    .or_else(|| account.get("Name"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unnamed account");
                let balance = amount(account.get("CurrentBalance"));
                if group.positive {
                    net += balance;
                } else {
                    net -= balance;
                }
                rows.push(ReportRow::data([name.to_string(), money(balance)]));
            }
        }

        if rows.is_empty() {
            return StrategyOutcome::Empty("no accounts found".to_string());
        }

        rows.push(ReportRow::summary([net_label.to_string(), money(net)]));

        StrategyOutcome::Data(ReportTree {
            header: ReportHeader {
                report_name: request.kind.api_name().to_string(),
                note: Some("Built from current account balances; the date range is not applied.".to_string()),
                ..ReportHeader::default()
            },
            columns: vec!["Account".to_string(), "Balance".to_string()],
            rows,
        })
    }
}

//
// ================= Strategy 3: transaction aggregation =================
//

struct SourceTotal {
    source: &'static str,
    count: usize,
    total: Decimal,
}

enum SideResult {
    Found(SourceTotal),
    Nothing { errors: Vec<LedgerError>, empties: usize },
}

pub struct TransactionAggregationStrategy;

impl TransactionAggregationStrategy {
    /// Try each source in order until one yields at least one record
    async fn first_with_records(
        api: &dyn AccountingApi,
        sources: &[&'static str],
        range: &DateRange,
    ) -> SideResult {
        let mut errors = Vec::new();
        let mut empties = 0;

        for &source in sources {
            let statement = format!(
                "SELECT * FROM {} WHERE TxnDate >= '{}' AND TxnDate <= '{}' MAXRESULTS {}",
                source,
                range.start_str(),
                range.end_str(),
                TRANSACTION_PAGE
            );
            match api.query(&statement).await {
                Ok(records) if !records.is_empty() => {
                    let total = records
                        .iter()
                        .map(|r| amount(r.get("TotalAmt")))
                        .fold(Decimal::ZERO, |acc, x| acc + x);
                    return SideResult::Found(SourceTotal {
                        source,
                        count: records.len(),
                        total,
                    });
                }
                Ok(_) => empties += 1,
                Err(e) => {
                    debug!(source, error = %e, "Transaction source unavailable");
                    errors.push(e);
                }
            }
        }

        SideResult::Nothing { errors, empties }
    }

    fn section(title: &str, total_label: &str, side: &SideResult) -> (ReportRow, Decimal) {
        let (detail, total) = match side {
            SideResult::Found(found) => (
                ReportRow::data([
                    format!("{} ({} records)", found.source, found.count),
                    money(found.total),
                ]),
                found.total,
            ),
            SideResult::Nothing { .. } => (
                ReportRow::placeholder([format!("No {} transactions found", title.to_lowercase()), money(Decimal::ZERO)]),
                Decimal::ZERO,
            ),
        };

        (
            ReportRow::Section {
                header: Some(vec![title.to_string(), String::new()]),
                rows: vec![detail, ReportRow::summary([total_label.to_string(), money(total)])],
            },
            total,
        )
    }
}

#[async_trait]
impl ReportStrategy for TransactionAggregationStrategy {
    fn name(&self) -> &'static str {
        "transaction_totals"
    }

    async fn attempt(&self, api: &dyn AccountingApi, request: &ResolvedReport) -> StrategyOutcome {
        if request.kind != ReportKind::ProfitAndLoss {
            return StrategyOutcome::Empty(format!(
                "{} cannot be rebuilt from transactions",
                request.kind
            ));
        }

        let income = Self::first_with_records(api, &INCOME_SOURCES, &request.range).await;
        let expenses = Self::first_with_records(api, &EXPENSE_SOURCES, &request.range).await;

        if let (
            SideResult::Nothing { errors: income_errors, empties: income_empty },
            SideResult::Nothing { errors: expense_errors, empties: expense_empty },
        ) = (&income, &expenses)
        {
            if income_empty + expense_empty == 0 {
                let mut errors = expense_errors.iter().chain(income_errors.iter());
                if let Some(e) = errors.next() {
                    return StrategyOutcome::Failed(clone_error(e));
                }
            }
            return StrategyOutcome::Empty("no transactions in range".to_string());
        }

        let (income_section, income_total) = Self::section("Income", "Total Income", &income);
        let (expense_section, expense_total) =
            Self::section("Expenses", "Total Expenses", &expenses);

        StrategyOutcome::Data(ReportTree {
            header: ReportHeader {
                report_name: request.kind.api_name().to_string(),
                note: Some("Estimated from transaction totals.".to_string()),
                ..ReportHeader::default()
            },
            columns: vec!["Account".to_string(), "Total".to_string()],
            rows: vec![
                income_section,
                expense_section,
                ReportRow::summary(["Net Income".to_string(), money(income_total - expense_total)]),
            ],
        })
    }
}

/// `LedgerError` wraps non-Clone library errors; rebuild the variants a
/// strategy can surface and fold the rest into their message.
fn clone_error(e: &LedgerError) -> LedgerError {
    match e {
        LedgerError::AuthRequired(m) => LedgerError::AuthRequired(m.clone()),
        LedgerError::AuthExpired(m) => LedgerError::AuthExpired(m.clone()),
        LedgerError::Unauthorized(m) => LedgerError::Unauthorized(m.clone()),
        LedgerError::PermissionDenied(m) => LedgerError::PermissionDenied(m.clone()),
        LedgerError::NotFound(m) => LedgerError::NotFound(m.clone()),
        LedgerError::TransientNetwork(m) => LedgerError::TransientNetwork(m.clone()),
        LedgerError::ValidationError(m) => LedgerError::ValidationError(m.clone()),
        other => LedgerError::MalformedResponse(other.to_string()),
    }
}
