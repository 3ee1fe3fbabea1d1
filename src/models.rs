//! Core data models for the ledgerflow pipeline

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

//
// ================= Intent =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Fetch,
    Create,
    Modify,
    Help,
    Diagnostic,
    Custom,
    #[default]
    Unknown,
}

impl IntentKind {
    /// Lenient parse of oracle output; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> IntentKind {
        match s.trim().to_lowercase().as_str() {
            "fetch" | "get" | "read" | "retrieve" => IntentKind::Fetch,
            "create" => IntentKind::Create,
            "modify" | "update" | "edit" => IntentKind::Modify,
            "help" => IntentKind::Help,
            "diagnostic" | "diagnostics" | "diagnose" | "test" => IntentKind::Diagnostic,
            "custom" | "raw" => IntentKind::Custom,
            _ => IntentKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Fetch => "fetch",
            IntentKind::Create => "create",
            IntentKind::Modify => "modify",
            IntentKind::Help => "help",
            IntentKind::Diagnostic => "diagnostic",
            IntentKind::Custom => "custom",
            IntentKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unvalidated intent guess as produced by an NLU oracle.
/// Every field is optional; the normalizer fills the gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawIntent {
    pub kind: Option<String>,
    pub action: Option<String>,
    pub entity: Option<String>,
    pub filters: Option<BTreeMap<String, Value>>,
    pub destination: Option<String>,
    pub parameters: Option<BTreeMap<String, Value>>,
    pub raw_api_call: Option<String>,
    pub raw_method: Option<String>,
    pub raw_payload: Option<Value>,
    pub explanation: Option<String>,
    pub defaults_applied: Option<bool>,
}

/// A validated, fully defaulted unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub kind: IntentKind,
    pub action: String,
    pub entity: String,
    pub filters: BTreeMap<String, Value>,
    pub destination: Option<String>,
    pub parameters: BTreeMap<String, Value>,
    pub raw_api_call: Option<String>,
    pub raw_method: Option<String>,
    pub raw_payload: Option<Value>,
    pub explanation: String,
    /// Set when the report date range was filled from defaults
    pub defaults_applied: bool,
}

impl Intent {
    pub fn filter_str(&self, key: &str) -> Option<&str> {
        self.filters
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn has_raw_override(&self) -> bool {
        self.raw_api_call.is_some() || self.raw_method.is_some() || self.raw_payload.is_some()
    }
}

impl From<Intent> for RawIntent {
    fn from(intent: Intent) -> Self {
        RawIntent {
            kind: Some(intent.kind.as_str().to_string()),
            action: Some(intent.action),
            entity: Some(intent.entity),
            filters: Some(intent.filters),
            destination: intent.destination,
            parameters: Some(intent.parameters),
            raw_api_call: intent.raw_api_call,
            raw_method: intent.raw_method,
            raw_payload: intent.raw_payload,
            explanation: Some(intent.explanation),
            defaults_applied: Some(intent.defaults_applied),
        }
    }
}

//
// ================= Tables =================
//

/// Rectangular table: a header row plus equally wide data rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Header row followed by the data rows
    pub fn grid(&self) -> Vec<Vec<String>> {
        let mut grid = Vec::with_capacity(self.rows.len() + 1);
        grid.push(self.headers.clone());
        grid.extend(self.rows.iter().cloned());
        grid
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }
}

//
// ================= Fallback diagnostics =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackAttempt {
    pub strategy: String,
    pub success: bool,
    pub detail: Option<String>,
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

//
// ================= Response envelope =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Text,
    Success,
    Error,
    Diagnostic,
    Help,
}

/// The single envelope handed back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn new(kind: ResponseType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            row_count: None,
            column_count: None,
            destination: None,
            explanation: None,
            data: None,
        }
    }

    pub fn text(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Text, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Error, message)
    }

    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Diagnostic, message)
    }

    pub fn help(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Help, message)
    }

    pub fn with_counts(mut self, rows: usize, columns: usize) -> Self {
        self.row_count = Some(rows);
        self.column_count = Some(columns);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
