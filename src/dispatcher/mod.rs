//! Execution dispatcher
//!
//! One normalized intent in, one response envelope out. Every failure is
//! converted into an `error` response here; nothing propagates past
//! `dispatch`.

use crate::accounting::{extract_query_records, AccountingApi};
use crate::audit::AuditSink;
use crate::auth::TokenManager;
use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::LedgerError;
use crate::formatter::format_records;
use crate::intent::normalizer::{
    canonical_entity, value_str, ACTION_ADD_ROW, ACTION_CLEAR_RANGE, ACTION_CREATE_ARTIFACT,
    ACTION_ENTITY, ACTION_QUERY, ACTION_REPORT, ACTION_UPDATE_DESTINATION, END_DATE, START_DATE,
};
use crate::models::{FallbackAttempt, Intent, IntentKind, Response, Table};
use crate::report::dates::current_month;
use crate::report::fallback::SKELETON_STRATEGY;
use crate::report::{flatten, headers_for, FallbackChain, ReportKind, ReportRequest};
use crate::sink::{DataSink, Destination};
use crate::Result;
use futures::FutureExt;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const DEFAULT_QUERY_LIMIT: u64 = 100;
pub const MAX_QUERY_LIMIT: u64 = 1000;

const HELP_MESSAGE: &str = "I can pull reports and records from your accounting system and write them into your sheets.";

const HELP_EXAMPLES: [(&str, &str); 7] = [
    ("Reports", "Show the profit and loss report for last month"),
    ("Reports", "Put this quarter's balance sheet in Summary!A1"),
    ("Records", "List customers into sheet Clients"),
    ("Sheets", "Create a new sheet named \"Q1 Budget\""),
    ("Sheets", "Clear Summary!A1:D20"),
    ("Diagnostics", "Run a connection diagnostic"),
    ("Advanced", "Call /companyinfo/{realm} directly"),
];

/// One diagnostic check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub elapsed_ms: u128,
}

pub struct Dispatcher {
    api: Arc<dyn AccountingApi>,
    sink: Arc<dyn DataSink>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    chain: FallbackChain,
    tokens: Option<Arc<TokenManager>>,
    last_attempts: RwLock<Vec<FallbackAttempt>>,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn AccountingApi>,
        sink: Arc<dyn DataSink>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            chain: FallbackChain::new(api.clone(), retry),
            api,
            sink,
            audit,
            clock,
            tokens: None,
            last_attempts: RwLock::new(Vec::new()),
        }
    }

    /// Include token status in diagnostics
    pub fn with_tokens(mut self, tokens: Arc<TokenManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub async fn last_attempts(&self) -> Vec<FallbackAttempt> {
        self.last_attempts.read().await.clone()
    }

    /// Run exactly one action for the intent. Errors and panics both come
    /// back as an `error` response.
    pub async fn dispatch(&self, intent: &Intent) -> Response {
        let label = format!("{}/{}", intent.kind, intent.action);
        info!(intent = %label, entity = %intent.entity, "Dispatching intent");

        let result = AssertUnwindSafe(self.route(intent))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(LedgerError::from_panic(payload)));

        let response = match result {
            Ok(response) => {
                self.audit.record("dispatch", &label, "success");
                response
            }
            Err(e) => {
                warn!(intent = %label, error = %e, "Dispatch failed");
                self.audit
                    .record("dispatch", &label, &format!("error: {}", e.kind()));
                Response::error(e.user_message())
            }
        };

        response.with_explanation(intent.explanation.clone())
    }

    async fn route(&self, intent: &Intent) -> Result<Response> {
        match intent.kind {
            IntentKind::Fetch => self.fetch(intent).await,
            IntentKind::Create => self.create(intent).await,
            IntentKind::Modify => self.modify(intent).await,
            IntentKind::Help => Ok(help(None)),
            IntentKind::Diagnostic => Ok(self.diagnose().await),
            IntentKind::Custom => self.custom(intent).await,
            IntentKind::Unknown => Ok(help(Some("I couldn't work out what you wanted."))),
        }
    }

    // ================= Fetch =================

    async fn fetch(&self, intent: &Intent) -> Result<Response> {
        match intent.action.as_str() {
            ACTION_REPORT => self.fetch_report(intent).await,
            ACTION_QUERY | ACTION_ENTITY => self.fetch_records(intent).await,
            other => Err(LedgerError::ValidationError(format!(
                "Unsupported fetch action '{}'",
                other
            ))),
        }
    }

    async fn fetch_report(&self, intent: &Intent) -> Result<Response> {
        let kind = ReportKind::parse(&intent.entity).ok_or_else(|| {
            LedgerError::ValidationError(format!("Unknown report '{}'", intent.entity))
        })?;

        let mut request = ReportRequest::new(
            kind,
            intent.filter_str(START_DATE).unwrap_or_default(),
            intent.filter_str(END_DATE).unwrap_or_default(),
        );
        if let Some(method) = option(intent, "accountingMethod") {
            request.accounting_method = method.to_string();
        }
        if let Some(summarize) = option(intent, "summarizeBy") {
            request.summarize_by = summarize.to_string();
        }

        let outcome = self.chain.fetch(&request, self.clock.today()).await;
        *self.last_attempts.write().await = outcome.attempts.clone();

        let headers = headers_for(&outcome.tree);
        let table = flatten(&outcome.tree, &headers);
        let period = format!(
            "{} to {}",
            outcome.tree.header.start_period.as_deref().unwrap_or("?"),
            outcome.tree.header.end_period.as_deref().unwrap_or("?")
        );

        let mut message = if outcome.strategy == SKELETON_STRATEGY {
            format!(
                "{} data is unavailable for {}. {}",
                kind.title(),
                period,
                outcome.tree.header.note.as_deref().unwrap_or_default()
            )
        } else if outcome.degraded() {
            format!(
                "{} for {} (estimated from {} because the report endpoint was unavailable)",
                kind.title(),
                period,
                outcome.strategy
            )
        } else {
            format!("{} for {}", kind.title(), period)
        };
        if intent.defaults_applied {
            message.push_str(" No period was given, so the current month was used.");
        }

        let data = json!({
            "report": kind.api_name(),
            "strategy": outcome.strategy,
            "attempts": outcome.attempts,
            "datesDefaulted": intent.defaults_applied || outcome.dates_defaulted,
            "header": outcome.tree.header,
        });

        self.materialize(intent, &table, Response::success(message), data)
            .await
    }

    async fn fetch_records(&self, intent: &Intent) -> Result<Response> {
        if intent.entity.is_empty() && option(intent, "query").is_none() {
            return Err(LedgerError::ValidationError(
                "Which records should I look up?".to_string(),
            ));
        }

        let records = if intent.action == ACTION_ENTITY {
            let id = option(intent, "id").ok_or_else(|| {
                LedgerError::ValidationError(format!("A record id is required to fetch a {}", intent.entity))
            })?;
            let entity = entity_name(&intent.entity)?;
            vec![self.api.entity(&entity, id).await?]
        } else {
            let statement = build_query(intent)?;
            self.api.query(&statement).await?
        };

        let table = format_records(&records);
        let label = if intent.entity.is_empty() { "matching" } else { intent.entity.as_str() };
        let message = format!("Found {} {} record(s)", records.len(), label);
        let data = json!({ "entity": intent.entity, "recordCount": records.len() });

        self.materialize(intent, &table, Response::success(message), data)
            .await
    }

    /// Write the table to the destination when one is set, otherwise attach it
    async fn materialize(
        &self,
        intent: &Intent,
        table: &Table,
        response: Response,
        mut data: Value,
    ) -> Result<Response> {
        let Some(locator) = intent.destination.as_deref() else {
            data["table"] = json!(table.grid());
            return Ok(response
                .with_counts(table.rows.len(), table.width())
                .with_data(data));
        };

        let destination = Destination::parse(locator)?;
        let include_headers = intent
            .parameters
            .get("includeHeaders")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let rows = if include_headers {
            table.grid()
        } else {
            table.rows.clone()
        };

        let summary = self.sink.write(&destination, &rows).await?;
        if !summary.success {
            return Err(LedgerError::Sink(format!("write to {} was rejected", destination)));
        }
        let message = format!(
            "{}. Wrote {} rows to {}.",
            response.message, summary.row_count, destination
        );

        Ok(Response {
            message,
            ..response
        }
        .with_counts(summary.row_count, summary.column_count)
        .with_destination(destination.to_string())
        .with_data(data))
    }

    // ================= Sheets =================

    async fn create(&self, intent: &Intent) -> Result<Response> {
        match intent.action.as_str() {
            ACTION_CREATE_ARTIFACT | "createSheet" => {
                let name = intent.param_str("name").ok_or_else(|| {
                    LedgerError::ValidationError("A sheet name is required".to_string())
                })?;
                let options = json!({
                    "headers": intent.parameters.get("headers").cloned().unwrap_or(Value::Null),
                });

                let summary = self.sink.create_artifact(name, &options).await?;
                Ok(Response::success(format!("Created sheet '{}'", name))
                    .with_counts(summary.row_count, summary.column_count)
                    .with_destination(name))
            }
            other => Err(LedgerError::ValidationError(format!(
                "Unsupported create action '{}'",
                other
            ))),
        }
    }

    async fn modify(&self, intent: &Intent) -> Result<Response> {
        let locator = intent
            .destination
            .as_deref()
            .or_else(|| intent.param_str("destination"))
            .ok_or_else(|| {
                LedgerError::ValidationError("Which sheet or range should I change?".to_string())
            })?;
        let destination = Destination::parse(locator)?;

        let (verb, summary) = match intent.action.as_str() {
            ACTION_UPDATE_DESTINATION | "updateRange" | "writeData" => {
                let rows = value_rows(intent)?;
                ("Wrote", self.sink.write(&destination, &rows).await?)
            }
            ACTION_ADD_ROW => {
                let mut rows = value_rows(intent)?;
                rows.truncate(1);
                ("Appended", self.sink.append_rows(&destination.sheet, &rows).await?)
            }
            ACTION_CLEAR_RANGE => ("Cleared", self.sink.clear_range(&destination).await?),
            other => {
                return Err(LedgerError::ValidationError(format!(
                    "Unsupported modify action '{}'",
                    other
                )))
            }
        };

        Ok(
            Response::success(format!("{} {} rows in {}", verb, summary.row_count, destination))
                .with_counts(summary.row_count, summary.column_count)
                .with_destination(destination.to_string()),
        )
    }

    // ================= Diagnostics =================

    /// Sequential probes; a failing probe is recorded, never raised
    async fn diagnose(&self) -> Response {
        let mut probes = Vec::new();

        if let Some(tokens) = &self.tokens {
            probes.push(
                probe("token", async {
                    tokens.ensure_access().await.map(|_| "access token available".to_string())
                })
                .await,
            );
        }

        probes.push(
            probe("company_info", async {
                let body = self.api.company_info().await?;
                let name = body
                    .get("CompanyName")
                    .and_then(Value::as_str)
                    .unwrap_or("company record returned");
                Ok::<_, LedgerError>(name.to_string())
            })
            .await,
        );

        probes.push(
            probe("sample_query", async {
                let records = self.api.query("SELECT * FROM Customer MAXRESULTS 1").await?;
                Ok::<_, LedgerError>(format!("{} record(s) returned", records.len()))
            })
            .await,
        );

        let month = current_month(self.clock.today());
        probes.push(
            probe("sample_report", async {
                let params = vec![
                    ("start_date".to_string(), month.start_str()),
                    ("end_date".to_string(), month.end_str()),
                ];
                self.api
                    .report(ReportKind::ProfitAndLoss.api_name(), &params)
                    .await
                    .map(|_| "ProfitAndLoss report reachable".to_string())
            })
            .await,
        );

        let passed = probes.iter().filter(|p| p.passed).count();
        let message = if passed == probes.len() {
            format!("All {} checks passed", probes.len())
        } else {
            format!("{} of {} checks passed", passed, probes.len())
        };

        Response::diagnostic(message).with_data(json!({
            "probes": probes,
            "strategies": self.chain.strategy_names(),
            "recentFallbackAttempts": self.last_attempts().await,
        }))
    }

    // ================= Custom passthrough =================

    async fn custom(&self, intent: &Intent) -> Result<Response> {
        let path = intent.raw_api_call.as_deref().ok_or_else(|| {
            LedgerError::ValidationError("A raw call needs an API path".to_string())
        })?;
        if path.contains("://") {
            return Err(LedgerError::ValidationError(
                "Raw calls take a path, not a full URL".to_string(),
            ));
        }

        let method_name = intent.raw_method.as_deref().unwrap_or("GET");
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            LedgerError::ValidationError(format!("Unsupported HTTP method '{}'", method_name))
        })?;

        let body = self
            .api
            .raw(method.clone(), path, intent.raw_payload.as_ref())
            .await?;

        if intent.destination.is_some() {
            let records = match extract_query_records(&body) {
                Ok(records) if !records.is_empty() => records,
                _ => vec![body.clone()],
            };
            let table = format_records(&records);
            return self
                .materialize(
                    intent,
                    &table,
                    Response::success(format!("{} {}", method, path)),
                    json!({ "path": path }),
                )
                .await;
        }

        Ok(Response::text(serde_json::to_string_pretty(&body)?).with_data(body))
    }
}

/// A filter or parameter value, filters first
fn option<'a>(intent: &'a Intent, key: &str) -> Option<&'a str> {
    intent
        .filters
        .get(key)
        .and_then(value_str)
        .or_else(|| intent.param_str(key))
}

fn help(preface: Option<&str>) -> Response {
    let message = match preface {
        Some(preface) => format!("{} {}", preface, HELP_MESSAGE),
        None => HELP_MESSAGE.to_string(),
    };
    let examples: Vec<Value> = HELP_EXAMPLES
        .iter()
        .map(|(topic, example)| json!({ "topic": topic, "example": example }))
        .collect();
    let reports: Vec<&str> = ReportKind::ALL.iter().map(|k| k.title()).collect();

    Response::help(message).with_data(json!({
        "examples": examples,
        "reports": reports,
    }))
}

async fn probe<F>(name: &str, check: F) -> ProbeResult
where
    F: Future<Output = Result<String>>,
{
    let started = Instant::now();
    let outcome = check.await;
    let elapsed_ms = started.elapsed().as_millis();

    match outcome {
        Ok(detail) => ProbeResult {
            name: name.to_string(),
            passed: true,
            detail,
            elapsed_ms,
        },
        Err(e) => ProbeResult {
            name: name.to_string(),
            passed: false,
            detail: format!("{}: {}", e.kind(), e),
            elapsed_ms,
        },
    }
}

// ================= Entity queries =================

fn entity_name(entity: &str) -> Result<String> {
    if entity.is_empty() || !entity.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LedgerError::ValidationError(format!(
            "'{}' is not a valid entity name",
            entity
        )));
    }
    Ok(canonical_entity(entity).unwrap_or(entity).to_string())
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Build the query statement for a `fetch/query` intent.
/// A literal `query` parameter wins over entity and filters.
pub fn build_query(intent: &Intent) -> Result<String> {
    if let Some(literal) = option(intent, "query") {
        return Ok(literal.to_string());
    }

    let entity = entity_name(&intent.entity)?;
    let mut predicates = Vec::new();

    for (key, value) in &intent.filters {
        let (field, op) = match key.as_str() {
            START_DATE => ("TxnDate", ">="),
            END_DATE => ("TxnDate", "<="),
            "limit" | "query" | "id" => continue,
            other => (other, "="),
        };
        if !is_field_name(field) {
            return Err(LedgerError::ValidationError(format!(
                "'{}' is not a valid field name",
                field
            )));
        }

        let rendered = match value {
            Value::String(s) => quote(s),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        predicates.push(format!("{} {} {}", field, op, rendered));
    }

    let limit = intent
        .parameters
        .get("limit")
        .or_else(|| intent.filters.get("limit"))
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT);

    let mut statement = format!("SELECT * FROM {}", entity);
    if !predicates.is_empty() {
        statement.push_str(" WHERE ");
        statement.push_str(&predicates.join(" AND "));
    }
    statement.push_str(&format!(" MAXRESULTS {}", limit));

    Ok(statement)
}

/// `parameters.values` as rows: an array of arrays, or one flat array
fn value_rows(intent: &Intent) -> Result<Vec<Vec<String>>> {
    let values = intent
        .parameters
        .get("values")
        .or_else(|| intent.parameters.get("row"))
        .and_then(Value::as_array)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LedgerError::ValidationError("No values to write".to_string()))?;

    let cell = |v: &Value| match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if values.iter().all(Value::is_array) {
        Ok(values
            .iter()
            .filter_map(Value::as_array)
            .map(|row| row.iter().map(cell).collect())
            .collect())
    } else {
        Ok(vec![values.iter().map(cell).collect()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::stub::{sample_customers, sample_pnl, StubAccountingApi};
    use crate::audit::AuditLog;
    use crate::clock::FixedClock;
    use crate::formatter::NO_RECORDS;
    use crate::intent::normalize;
    use crate::models::{RawIntent, ResponseType};
    use crate::report::fallback::UNAVAILABLE_LABEL;
    use crate::sink::InMemorySheetSink;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    struct Harness {
        dispatcher: Dispatcher,
        api: Arc<StubAccountingApi>,
        sink: Arc<InMemorySheetSink>,
        audit: Arc<AuditLog>,
    }

    fn harness(api: StubAccountingApi) -> Harness {
        let api = Arc::new(api);
        let sink = Arc::new(InMemorySheetSink::new());
        let audit = Arc::new(AuditLog::new());
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        };
        let dispatcher = Dispatcher::new(
            api.clone(),
            sink.clone(),
            audit.clone(),
            Arc::new(FixedClock(today())),
            retry,
        );
        Harness {
            dispatcher,
            api,
            sink,
            audit,
        }
    }

    fn intent(kind: &str, action: &str, query: &str) -> Intent {
        let raw = RawIntent {
            kind: Some(kind.to_string()),
            action: Some(action.to_string()),
            ..RawIntent::default()
        };
        normalize(raw, query, today())
    }

    #[tokio::test]
    async fn test_report_success_without_destination() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let response = h
            .dispatcher
            .dispatch(&intent("fetch", "report", "profit and loss last month"))
            .await;

        assert_eq!(response.kind, ResponseType::Success);
        assert_eq!(response.row_count, Some(3));
        assert_eq!(response.column_count, Some(2));
        let data = response.data.unwrap();
        assert_eq!(data["strategy"], "direct_report");
        assert_eq!(data["table"][1][0], "Income");
        assert!(response.explanation.is_some());
    }

    #[tokio::test]
    async fn test_all_strategies_failing_still_succeeds() {
        let h = harness(StubAccountingApi::locked());
        let response = h
            .dispatcher
            .dispatch(&intent("fetch", "report", "profit and loss last month"))
            .await;

        assert_eq!(response.kind, ResponseType::Success);
        let data = response.data.unwrap();
        assert_eq!(data["strategy"], SKELETON_STRATEGY);
        assert_eq!(data["table"][1][0], UNAVAILABLE_LABEL);
        assert!(response.message.contains("admin credentials"));

        let attempts = h.dispatcher.last_attempts().await;
        assert_eq!(attempts.len(), 4);
        assert!(attempts[..3].iter().all(|a| !a.success));
    }

    #[tokio::test]
    async fn test_report_written_to_destination() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let mut fetch = intent("fetch", "report", "p&l");
        fetch.destination = Some("Summary!A1".to_string());

        let response = h.dispatcher.dispatch(&fetch).await;
        assert_eq!(response.kind, ResponseType::Success);
        assert_eq!(response.destination.as_deref(), Some("Summary!A1"));
        assert_eq!(response.row_count, Some(4));

        let grid = h.sink.sheet("Summary").await.unwrap();
        assert_eq!(grid[0], vec!["Account", "Total"]);
        assert_eq!(grid[2], vec!["Sales", "1200.00"]);
    }

    #[tokio::test]
    async fn test_entity_query_formats_records() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let response = h
            .dispatcher
            .dispatch(&intent("fetch", "query", "list customers"))
            .await;

        assert_eq!(response.kind, ResponseType::Success);
        assert_eq!(response.row_count, Some(2));
        let data = response.data.unwrap();
        assert_eq!(data["table"][0], json!(["Id", "DisplayName", "BillAddr.City"]));
        assert_eq!(data["table"][2], json!(["2", "Globex", ""]));
        assert_eq!(h.api.statements(), vec!["SELECT * FROM Customer MAXRESULTS 100"]);
    }

    #[tokio::test]
    async fn test_empty_query_writes_informational_row() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), Vec::new()));
        let mut fetch = intent("fetch", "query", "list invoices");
        fetch.destination = Some("Out!A1".to_string());
        fetch.parameters.insert("includeHeaders".to_string(), json!(false));

        let response = h.dispatcher.dispatch(&fetch).await;
        assert_eq!(response.kind, ResponseType::Success);
        assert_eq!(response.row_count, Some(1));
        let grid = h.sink.sheet("Out").await.unwrap();
        assert_eq!(grid, vec![vec![NO_RECORDS.to_string()]]);
    }

    #[tokio::test]
    async fn test_entity_fetch_by_id() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let mut fetch = intent("fetch", "entity", "customer");
        fetch.parameters.insert("id".to_string(), json!("2"));

        let response = h.dispatcher.dispatch(&fetch).await;
        assert_eq!(response.row_count, Some(1));

        fetch.parameters.insert("id".to_string(), json!("99"));
        let missing = h.dispatcher.dispatch(&fetch).await;
        assert_eq!(missing.kind, ResponseType::Error);
    }

    #[test]
    fn test_build_query_with_filters() {
        let mut q = intent("fetch", "query", "invoices");
        q.filters = BTreeMap::from([
            ("startDate".to_string(), json!("2024-01-01")),
            ("CustomerRef".to_string(), json!("O'Brien")),
            ("Balance".to_string(), json!(0)),
        ]);
        q.parameters.insert("limit".to_string(), json!("5000"));

        assert_eq!(
            build_query(&q).unwrap(),
            "SELECT * FROM Invoice WHERE Balance = 0 AND CustomerRef = 'O\\'Brien' AND TxnDate >= '2024-01-01' MAXRESULTS 1000"
        );

        q.filters = BTreeMap::from([("Name; DROP".to_string(), json!("x"))]);
        assert!(build_query(&q).is_err());

        q.entity = "Invoice; --".to_string();
        q.filters.clear();
        assert!(matches!(build_query(&q), Err(LedgerError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_unknown_and_help() {
        let h = harness(StubAccountingApi::locked());
        let unknown = normalize(RawIntent::default(), "qwerty", today());
        let response = h.dispatcher.dispatch(&unknown).await;
        assert_eq!(response.kind, ResponseType::Help);
        assert!(response.data.unwrap()["examples"].as_array().unwrap().len() > 3);

        let help = h.dispatcher.dispatch(&intent("help", "", "help")).await;
        assert_eq!(help.kind, ResponseType::Help);
        assert!(h.api.statements().is_empty());
    }

    #[tokio::test]
    async fn test_diagnostic_captures_failures() {
        let h = harness(StubAccountingApi::locked());
        let response = h.dispatcher.dispatch(&intent("diagnostic", "", "")).await;

        assert_eq!(response.kind, ResponseType::Diagnostic);
        let data = response.data.unwrap();
        let probes = data["probes"].as_array().unwrap();
        assert_eq!(probes.len(), 3);
        assert!(probes.iter().all(|p| p["passed"] == false));
        assert!(response.message.starts_with("0 of 3"));
    }

    #[tokio::test]
    async fn test_diagnostic_all_passing() {
        let h = harness(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let response = h.dispatcher.dispatch(&intent("diagnostic", "", "")).await;
        assert_eq!(response.message, "All 3 checks passed");
        assert_eq!(response.data.unwrap()["probes"][0]["detail"], "Sandbox Co");
    }

    #[tokio::test]
    async fn test_sheet_actions() {
        let h = harness(StubAccountingApi::locked());

        let mut create = intent("create", "", "create a sheet named Budget");
        create.parameters.insert("headers".to_string(), json!(["Month", "Amount"]));
        let created = h.dispatcher.dispatch(&create).await;
        assert_eq!(created.kind, ResponseType::Success);

        let mut add = intent("modify", "addRow", "");
        add.destination = Some("Budget".to_string());
        add.parameters.insert("values".to_string(), json!(["Jan", 500]));
        let added = h.dispatcher.dispatch(&add).await;
        assert_eq!(added.kind, ResponseType::Success);

        let grid = h.sink.sheet("Budget").await.unwrap();
        assert_eq!(grid[1], vec!["Jan", "500"]);

        let mut clear = intent("modify", "clearRange", "");
        clear.destination = Some("Missing!A1:B2".to_string());
        let failed = h.dispatcher.dispatch(&clear).await;
        assert_eq!(failed.kind, ResponseType::Error);

        let no_dest = h.dispatcher.dispatch(&intent("modify", "clearRange", "")).await;
        assert_eq!(no_dest.kind, ResponseType::Error);
    }

    #[tokio::test]
    async fn test_custom_passthrough() {
        let h = harness(StubAccountingApi::locked());
        let raw = RawIntent {
            raw_api_call: Some("preferences".to_string()),
            ..RawIntent::default()
        };
        let response = h.dispatcher.dispatch(&normalize(raw, "", today())).await;

        assert_eq!(response.kind, ResponseType::Text);
        assert_eq!(h.api.raw_calls.lock().unwrap().as_slice(), ["GET /preferences"]);

        let absolute = RawIntent {
            raw_api_call: Some("https://evil.example/x".to_string()),
            ..RawIntent::default()
        };
        let rejected = h.dispatcher.dispatch(&normalize(absolute, "", today())).await;
        assert_eq!(rejected.kind, ResponseType::Error);
    }

    #[tokio::test]
    async fn test_dispatch_is_audited() {
        let h = harness(StubAccountingApi::locked());
        h.dispatcher.dispatch(&intent("help", "", "")).await;
        h.dispatcher.dispatch(&intent("modify", "clearRange", "")).await;

        let entries = h.audit.entries_for("dispatch");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].result, "success");
        assert_eq!(entries[1].result, "error: validation_error");
    }

    /// API whose record queries panic mid-call
    struct PanickingApi;

    #[async_trait::async_trait]
    impl AccountingApi for PanickingApi {
        async fn report(&self, _t: &str, _p: &[(String, String)]) -> crate::Result<Value> {
            Err(LedgerError::PermissionDenied("403".into()))
        }

        async fn query(&self, _statement: &str) -> crate::Result<Vec<Value>> {
            panic!("record decoder blew up")
        }

        async fn entity(&self, _e: &str, _id: &str) -> crate::Result<Value> {
            Err(LedgerError::NotFound("entity".into()))
        }

        async fn company_info(&self) -> crate::Result<Value> {
            Ok(json!({}))
        }

        async fn raw(&self, _m: Method, _p: &str, _b: Option<&Value>) -> crate::Result<Value> {
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let audit = Arc::new(AuditLog::new());
        let dispatcher = Dispatcher::new(
            Arc::new(PanickingApi),
            Arc::new(InMemorySheetSink::new()),
            audit.clone(),
            Arc::new(FixedClock(today())),
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
            },
        );

        let response = dispatcher.dispatch(&intent("fetch", "query", "list customers")).await;
        assert_eq!(response.kind, ResponseType::Error);
        assert!(!response.message.contains("decoder"));
        assert!(response.explanation.is_some());
        assert_eq!(audit.entries_for("dispatch")[0].result, "error: internal");

        let after = dispatcher.dispatch(&intent("help", "", "")).await;
        assert_eq!(after.kind, ResponseType::Help);
    }
}
