//! NLU oracles: free text in, raw intent guess out
//!
//! `KeywordOracle` is deterministic and needs no network. `GeminiOracle`
//! asks the LLM for a JSON intent and parses it leniently.

use crate::error::LedgerError;
use crate::gemini::GeminiClient;
use crate::models::{HistoryTurn, RawIntent, TurnRole};
use crate::report::ReportKind;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::normalizer::{
    detect_entity, extract_name, ACTION_ADD_ROW, ACTION_CLEAR_RANGE, ACTION_CREATE_ARTIFACT,
    ACTION_QUERY, ACTION_REPORT,
};

/// Converts a user sentence plus recent history into an intent guess
#[async_trait]
pub trait NluOracle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn interpret(
        &self,
        query: &str,
        history: &[HistoryTurn],
        available_actions: &[&str],
    ) -> Result<RawIntent>;
}

// ================= Keyword oracle =================

/// Deterministic keyword routing
#[derive(Debug, Default, Clone)]
pub struct KeywordOracle;

impl KeywordOracle {
    pub fn new() -> Self {
        Self
    }

    pub fn guess(query: &str) -> RawIntent {
        let description = query.trim();
        let lowered = description.to_lowercase();

        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
        let destination = find_destination(description);

        let build = |kind: &str, action: &str| RawIntent {
            kind: Some(kind.to_string()),
            action: Some(action.to_string()),
            destination: destination.clone(),
            ..RawIntent::default()
        };

        if lowered.is_empty() || has_any(&["help", "what can you do", "how do i", "commands"]) {
            return build("help", "");
        }

        if has_any(&["diagnos", "test connection", "check connection", "health check", "status check"]) {
            return build("diagnostic", "");
        }

        let mentions_sheet = has_any(&["sheet", "tab", "worksheet"]);
        if has_any(&["create", "new sheet", "make a sheet", "add a sheet", "add sheet"]) && mentions_sheet {
            let mut intent = build("create", ACTION_CREATE_ARTIFACT);
            if let Some(name) = extract_name(description) {
                intent.parameters = Some(BTreeMap::from([("name".to_string(), json!(name))]));
            }
            return intent;
        }

        if has_any(&["clear", "erase", "wipe"]) {
            return build("modify", ACTION_CLEAR_RANGE);
        }

        if has_any(&["add row", "add a row", "append"]) {
            return build("modify", ACTION_ADD_ROW);
        }

        if let Some(kind) = ReportKind::detect(description) {
            let mut intent = build("fetch", ACTION_REPORT);
            intent.entity = Some(kind.api_name().to_string());
            return intent;
        }

        if let Some(entity) = detect_entity(description) {
            let mut intent = build("fetch", ACTION_QUERY);
            intent.entity = Some(entity.to_string());
            return intent;
        }

        if has_any(&["report", "revenue", "profit", "expenses", "income"]) {
            return build("fetch", ACTION_REPORT);
        }

        RawIntent::default()
    }
}

#[async_trait]
impl NluOracle for KeywordOracle {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn interpret(
        &self,
        query: &str,
        _history: &[HistoryTurn],
        _available_actions: &[&str],
    ) -> Result<RawIntent> {
        Ok(Self::guess(query))
    }
}

/// First `Sheet!A1` style token, or the word after "to sheet"/"into sheet"
fn find_destination(text: &str) -> Option<String> {
    if let Some(token) = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | '"' | '\'' | '(' | ')')))
        .find(|w| w.contains('!') && w.len() > 1 && !w.ends_with('!'))
    {
        return Some(token.to_string());
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    words.windows(3).find_map(|w| {
        let lead = w[0].to_lowercase();
        let noun = w[1].to_lowercase();
        if matches!(lead.as_str(), "to" | "into" | "in") && matches!(noun.as_str(), "sheet" | "tab") {
            let name = w[2].trim_matches(|c: char| c.is_ascii_punctuation());
            (!name.is_empty()).then(|| format!("{}!A1", name))
        } else {
            None
        }
    })
}

// ================= Gemini oracle =================

pub struct GeminiOracle {
    client: GeminiClient,
    history_turns: usize,
}

impl GeminiOracle {
    pub fn new(client: GeminiClient, history_turns: usize) -> Self {
        Self {
            client,
            history_turns,
        }
    }

    fn build_system_prompt(available_actions: &[&str]) -> String {
        let reports: Vec<&str> = ReportKind::ALL.iter().map(|k| k.api_name()).collect();

        format!(
            r#"You translate bookkeeping requests into a JSON intent for an accounting assistant.

Available actions:
- {}

Reports: {}

Rules:
- Return ONLY valid JSON
- No explanation text outside the JSON
- Use ISO dates (YYYY-MM-DD)
- Omit fields you cannot infer
- JSON format:

{{
  "kind": "fetch | create | modify | help | diagnostic | custom",
  "action": "report | query | entity | createArtifact | addRow | clearRange | updateDestination",
  "entity": "ProfitAndLoss | Customer | ...",
  "filters": {{ "startDate": "YYYY-MM-DD", "endDate": "YYYY-MM-DD" }},
  "destination": "Sheet1!A1",
  "parameters": {{ }},
  "rawApiCall": "/path for direct API calls",
  "rawMethod": "GET",
  "rawPayload": {{ }},
  "explanation": "one sentence"
}}
"#,
            available_actions.join("\n- "),
            reports.join(", ")
        )
    }

    fn build_prompt(&self, query: &str, history: &[HistoryTurn]) -> String {
        let skip = history.len().saturating_sub(self.history_turns);
        let context: Vec<String> = history
            .iter()
            .skip(skip)
            .map(|turn| {
                let who = match turn.role {
                    TurnRole::User => "User",
                    TurnRole::Assistant => "Assistant",
                };
                format!("{}: {}", who, turn.content)
            })
            .collect();

        if context.is_empty() {
            format!("REQUEST:\n{}", query)
        } else {
            format!(
                "CONVERSATION:\n{}\n\nREQUEST:\n{}",
                context.join("\n"),
                query
            )
        }
    }
}

#[async_trait]
impl NluOracle for GeminiOracle {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn interpret(
        &self,
        query: &str,
        history: &[HistoryTurn],
        available_actions: &[&str],
    ) -> Result<RawIntent> {
        let system = Self::build_system_prompt(available_actions);
        let prompt = self.build_prompt(query, history);

        let response = self.client.generate(&system, &prompt).await?;
        debug!("Oracle response: {}", response);

        parse_intent_response(&response)
    }
}

/// Parse an LLM reply into a raw intent, tolerating markdown fences
pub fn parse_intent_response(response: &str) -> Result<RawIntent> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json: Value = serde_json::from_str(cleaned).map_err(|e| {
        warn!("Unparseable oracle response: {}", e);
        LedgerError::Oracle(format!("Failed to parse intent response: {} | raw={}", e, response))
    })?;

    if !json.is_object() {
        return Err(LedgerError::Oracle(format!(
            "Intent response is not an object | raw={}",
            response
        )));
    }

    serde_json::from_value(json)
        .map_err(|e| LedgerError::Oracle(format!("Intent response has the wrong shape: {}", e)))
}
