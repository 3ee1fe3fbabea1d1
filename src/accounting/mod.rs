//! Accounting API collaborator
//!
//! `AccountingApi` is the seam the pipeline talks through. `QuickBooksClient`
//! is the live HTTP implementation; every call goes through the token
//! manager's refresh-and-retry wrapper.

use crate::auth::TokenManager;
use crate::config::AccountingConfig;
use crate::error::LedgerError;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait AccountingApi: Send + Sync {
    /// `GET /reports/{report_type}` with query parameters
    async fn report(&self, report_type: &str, params: &[(String, String)]) -> Result<Value>;

    /// Run a query-language statement and return the matched records
    async fn query(&self, statement: &str) -> Result<Vec<Value>>;

    /// Read a single record by id
    async fn entity(&self, entity: &str, id: &str) -> Result<Value>;

    /// The company record itself, without the `CompanyInfo` wrapper
    async fn company_info(&self) -> Result<Value>;

    /// Low-level passthrough; `path` is relative to the company endpoint
    async fn raw(&self, method: Method, path: &str, payload: Option<&Value>) -> Result<Value>;
}

/// Unwrap `{"CompanyInfo": {...}}`; other bodies pass through.
pub fn company_record(mut body: Value) -> Value {
    match body.get_mut("CompanyInfo") {
        Some(record) => record.take(),
        None => body,
    }
}

/// Pull the record list out of a `{"QueryResponse": {"Entity": [...]}}` body.
/// A response without any array (no matches) yields an empty list.
pub fn extract_query_records(body: &Value) -> Result<Vec<Value>> {
    let response = body.get("QueryResponse").ok_or_else(|| {
        LedgerError::MalformedResponse("query response has no QueryResponse".to_string())
    })?;

    let records = response
        .as_object()
        .and_then(|obj| obj.values().find_map(|v| v.as_array()))
        .cloned()
        .unwrap_or_default();

    Ok(records)
}

/// Map an HTTP status to the error taxonomy
pub fn classify_status(status: StatusCode, context: &str, body: &str) -> LedgerError {
    let detail = format!("{} returned {}: {}", context, status, truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED => LedgerError::Unauthorized(detail),
        StatusCode::FORBIDDEN => LedgerError::PermissionDenied(detail),
        StatusCode::NOT_FOUND => LedgerError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            LedgerError::TransientNetwork(detail)
        }
        s if s.is_server_error() => LedgerError::TransientNetwork(detail),
        _ => LedgerError::ValidationError(detail),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub struct QuickBooksClient {
    client: Client,
    base_url: String,
    realm_id: String,
    minor_version: u32,
    tokens: Arc<TokenManager>,
}

impl QuickBooksClient {
    pub fn new(config: &AccountingConfig, tokens: Arc<TokenManager>) -> Result<Self> {
        if config.realm_id.is_empty() {
            return Err(LedgerError::Configuration(
                "QBO_REALM_ID is not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            realm_id: config.realm_id.clone(),
            minor_version: config.minor_version,
            tokens,
        })
    }

    fn company_url(&self, path: &str) -> String {
        format!(
            "{}/v3/company/{}{}",
            self.base_url, self.realm_id, path
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        payload: Option<&Value>,
        token: String,
    ) -> Result<Value> {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(&[("minorversion", self.minor_version.to_string())])
            .query(query);

        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_status(status, url, &text));
        }

        serde_json::from_str::<Value>(&text).map_err(|e| {
            LedgerError::MalformedResponse(format!("invalid JSON from {}: {}", url, e))
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        payload: Option<&Value>,
    ) -> Result<Value> {
        let url = self.company_url(path);
        let url = url.as_str();
        let method = &method;

        debug!(%method, path, "Calling accounting API");

        self.tokens
            .refresh_and_retry_once(move |token| {
                self.send(method.clone(), url, query, payload, token)
            })
            .await
    }
}

#[async_trait]
impl AccountingApi for QuickBooksClient {
    async fn report(&self, report_type: &str, params: &[(String, String)]) -> Result<Value> {
        self.call(Method::GET, &format!("/reports/{}", report_type), params, None)
            .await
    }

    async fn query(&self, statement: &str) -> Result<Vec<Value>> {
        let params = vec![("query".to_string(), statement.to_string())];
        let body = self.call(Method::GET, "/query", &params, None).await?;
        extract_query_records(&body)
    }

    async fn entity(&self, entity: &str, id: &str) -> Result<Value> {
        let path = format!("/{}/{}", entity.to_lowercase(), id);
        let body = self.call(Method::GET, &path, &[], None).await?;
        body.get(entity).cloned().ok_or_else(|| {
            LedgerError::MalformedResponse(format!("response has no '{}' object", entity))
        })
    }

    async fn company_info(&self) -> Result<Value> {
        let path = format!("/companyinfo/{}", self.realm_id);
        let body = self.call(Method::GET, &path, &[], None).await?;
        Ok(company_record(body))
    }

    async fn raw(&self, method: Method, path: &str, payload: Option<&Value>) -> Result<Value> {
        self.call(method, path, &[], payload).await
    }
}

/// Canned accounting API for pipeline tests
#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    pub(crate) struct StubAccountingApi {
        /// `None` makes every report call fail with `PermissionDenied`
        pub report: Option<Value>,
        /// `None` makes every query fail with `PermissionDenied`
        pub records: Option<Vec<Value>>,
        pub statements: Mutex<Vec<String>>,
        pub report_params: Mutex<Vec<Vec<(String, String)>>>,
        pub raw_calls: Mutex<Vec<String>>,
    }

    impl StubAccountingApi {
        pub(crate) fn healthy(report: Value, records: Vec<Value>) -> Self {
            Self {
                report: Some(report),
                records: Some(records),
                statements: Mutex::new(Vec::new()),
                report_params: Mutex::new(Vec::new()),
                raw_calls: Mutex::new(Vec::new()),
            }
        }

        /// Every call is refused
        pub(crate) fn locked() -> Self {
            Self {
                report: None,
                records: None,
                statements: Mutex::new(Vec::new()),
                report_params: Mutex::new(Vec::new()),
                raw_calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    pub(crate) fn sample_pnl() -> Value {
        json!({
            "Header": {"ReportName": "ProfitAndLoss", "StartPeriod": "2024-02-01", "EndPeriod": "2024-02-29"},
            "Columns": {"Column": [{"ColTitle": "", "ColType": "Account"}, {"ColTitle": "Total", "ColType": "Money"}]},
            "Rows": {"Row": [
                {
                    "type": "Section",
                    "Header": {"ColData": [{"value": "Income"}, {"value": ""}]},
                    "Rows": {"Row": [
                        {"type": "Data", "ColData": [{"value": "Sales"}, {"value": "1200.00"}]}
                    ]},
                    "Summary": {"ColData": [{"value": "Total Income"}, {"value": "1200.00"}]}
                }
            ]}
        })
    }

    pub(crate) fn sample_customers() -> Vec<Value> {
        vec![
            json!({"Id": "1", "DisplayName": "Acme", "BillAddr": {"City": "Austin"}}),
            json!({"Id": "2", "DisplayName": "Globex"}),
        ]
    }

    fn denied() -> LedgerError {
        LedgerError::PermissionDenied("scope not granted".to_string())
    }

    #[async_trait]
    impl AccountingApi for StubAccountingApi {
        async fn report(&self, _report_type: &str, params: &[(String, String)]) -> Result<Value> {
            self.report_params.lock().unwrap().push(params.to_vec());
            self.report.clone().ok_or_else(denied)
        }

        async fn query(&self, statement: &str) -> Result<Vec<Value>> {
            self.statements.lock().unwrap().push(statement.to_string());
            self.records.clone().ok_or_else(denied)
        }

        async fn entity(&self, entity: &str, id: &str) -> Result<Value> {
            let records = self.records.as_ref().ok_or_else(denied)?;
            records
                .iter()
                .find(|r| r.get("Id").and_then(Value::as_str) == Some(id))
                .cloned()
                .ok_or_else(|| LedgerError::NotFound(format!("{} {}", entity, id)))
        }

        async fn company_info(&self) -> Result<Value> {
            match self.records {
                Some(_) => Ok(json!({"CompanyName": "Sandbox Co"})),
                None => Err(denied()),
            }
        }

        async fn raw(&self, method: Method, path: &str, _payload: Option<&Value>) -> Result<Value> {
            self.raw_calls.lock().unwrap().push(format!("{} {}", method, path));
            Ok(json!({"path": path}))
        }
    }
}
