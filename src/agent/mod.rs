//! Assistant - the request pipeline
//!
//! QUERY → ORACLE → NORMALIZE → DISPATCH → REMEMBER

use crate::accounting::QuickBooksClient;
use crate::audit::{AuditLog, AuditSink};
use crate::auth::{OAuthRefresher, TokenManager};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::LedgerError;
use crate::gemini::GeminiClient;
use crate::intent::{normalize, GeminiOracle, KeywordOracle, NluOracle, AVAILABLE_ACTIONS};
use crate::memory::ConversationStore;
use crate::models::{Intent, IntentKind, RawIntent, Response, TurnRole};
use crate::sink::{DataSink, InMemorySheetSink};
use crate::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHAT_ID: &str = "default";

pub struct Assistant {
    oracle: Arc<dyn NluOracle>,
    dispatcher: Dispatcher,
    memory: ConversationStore,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    history_turns: usize,
}

impl Assistant {
    pub fn new(
        oracle: Arc<dyn NluOracle>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        history_turns: usize,
    ) -> Self {
        Self {
            oracle,
            dispatcher,
            memory: ConversationStore::new(history_turns.max(1) * 2),
            clock,
            audit,
            history_turns,
        }
    }

    /// Wire the live pipeline: QuickBooks client, Gemini oracle when a key
    /// is configured (keyword routing otherwise), in-memory sheets.
    pub async fn from_config(config: &AppConfig) -> Result<(Self, Arc<TokenManager>, Arc<AuditLog>)> {
        let audit = Arc::new(AuditLog::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let refresher = Arc::new(OAuthRefresher::new(&config.accounting)?);
        let tokens = Arc::new(
            TokenManager::from_config(&config.accounting, refresher, audit.clone()).await,
        );
        let api = Arc::new(QuickBooksClient::new(&config.accounting, tokens.clone())?);
        let sink: Arc<dyn DataSink> = Arc::new(InMemorySheetSink::new());

        let client = GeminiClient::new(&config.oracle)?;
        let oracle: Arc<dyn NluOracle> = if client.is_configured() {
            info!(model = %config.oracle.model, "Using Gemini oracle");
            Arc::new(GeminiOracle::new(client, config.history_turns))
        } else {
            warn!("GEMINI_API_KEY not set; using keyword routing");
            Arc::new(KeywordOracle::new())
        };

        let dispatcher = Dispatcher::new(api, sink, audit.clone(), clock.clone(), config.retry)
            .with_tokens(tokens.clone());
        let assistant = Self::new(oracle, dispatcher, clock, audit.clone(), config.history_turns);

        Ok((assistant, tokens, audit))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Resolve a query into a normalized intent. An oracle failure yields
    /// `unknown`, which the dispatcher answers with help.
    pub async fn interpret(&self, query: &str, chat_id: &str) -> Intent {
        let history = self.memory.recent(chat_id, self.history_turns).await;

        let raw = match self
            .oracle
            .interpret(query, &history, &AVAILABLE_ACTIONS)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(oracle = self.oracle.name(), error = %e, "Oracle failed; treating as unknown");
                self.audit
                    .record("oracle", self.oracle.name(), &format!("error: {}", e.kind()));
                RawIntent::default()
            }
        };

        let intent = normalize(raw, query, self.clock.today());
        debug!(?intent, "Normalized intent");
        intent
    }

    /// Run one query through the full pipeline
    pub async fn handle(&self, query: &str, chat_id: &str) -> Response {
        let start = Instant::now();
        info!(chat_id, query, "Assistant: handling query");

        let interpreted = AssertUnwindSafe(self.interpret(query, chat_id))
            .catch_unwind()
            .await;
        let (kind, response) = match interpreted {
            Ok(intent) => (intent.kind, self.dispatcher.dispatch(&intent).await),
            Err(payload) => {
                let e = LedgerError::from_panic(payload);
                error!(chat_id, error = %e, "Interpretation panicked");
                self.audit.record("interpret", chat_id, &format!("error: {}", e.kind()));
                (IntentKind::Unknown, Response::error(e.user_message()))
            }
        };

        self.memory.record(chat_id, TurnRole::User, query).await;
        self.memory
            .record(chat_id, TurnRole::Assistant, response.message.clone())
            .await;

        info!(
            chat_id,
            kind = %kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Assistant: query complete"
        );

        response
    }

    /// Drop a chat's history
    pub async fn forget(&self, chat_id: &str) -> bool {
        self.memory.clear(chat_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::stub::{sample_customers, sample_pnl, StubAccountingApi};
    use crate::clock::FixedClock;
    use crate::config::RetryConfig;
    use crate::models::{HistoryTurn, ResponseType};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Oracle that always fails and remembers how much history it saw
    #[derive(Default)]
    struct BrokenOracle {
        seen_history: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl NluOracle for BrokenOracle {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn interpret(
            &self,
            _query: &str,
            history: &[HistoryTurn],
            _available_actions: &[&str],
        ) -> crate::Result<RawIntent> {
            self.seen_history.lock().unwrap().push(history.len());
            Err(LedgerError::Oracle("model returned prose".to_string()))
        }
    }

    struct PanickingOracle;

    #[async_trait]
    impl NluOracle for PanickingOracle {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn interpret(
            &self,
            _query: &str,
            _history: &[HistoryTurn],
            _available_actions: &[&str],
        ) -> crate::Result<RawIntent> {
            panic!("tokenizer state corrupted")
        }
    }

    fn assistant(
        oracle: Arc<dyn NluOracle>,
        api: Arc<StubAccountingApi>,
    ) -> (Assistant, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let clock = Arc::new(FixedClock(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()));
        let dispatcher = Dispatcher::new(
            api,
            Arc::new(InMemorySheetSink::new()),
            audit.clone(),
            clock.clone(),
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
            },
        );
        (
            Assistant::new(oracle, dispatcher, clock, audit.clone(), 4),
            audit,
        )
    }

    #[tokio::test]
    async fn test_last_month_report_end_to_end() {
        let api = Arc::new(StubAccountingApi::healthy(sample_pnl(), sample_customers()));
        let (assistant, _) = assistant(Arc::new(KeywordOracle::new()), api.clone());

        let response = assistant
            .handle("Fetch profit and loss report for last month", "chat-1")
            .await;

        assert_eq!(response.kind, ResponseType::Success);
        let params = api.report_params.lock().unwrap().clone();
        assert_eq!(params.len(), 1);
        assert!(params[0].contains(&("start_date".to_string(), "2024-02-01".to_string())));
        assert!(params[0].contains(&("end_date".to_string(), "2024-02-29".to_string())));
    }

    #[tokio::test]
    async fn test_oracle_failure_fails_closed_to_help() {
        let api = Arc::new(StubAccountingApi::locked());
        let oracle = Arc::new(BrokenOracle::default());
        let (assistant, audit) = assistant(oracle.clone(), api.clone());

        let intent = assistant.interpret("do the thing", "c").await;
        assert_eq!(intent.kind, IntentKind::Unknown);

        let response = assistant.handle("do the thing", "c").await;
        assert_eq!(response.kind, ResponseType::Help);
        assert!(api.statements().is_empty());
        assert_eq!(audit.entries_for("oracle").len(), 2);
    }

    #[tokio::test]
    async fn test_oracle_panic_still_answers() {
        let api = Arc::new(StubAccountingApi::locked());
        let (assistant, audit) = assistant(Arc::new(PanickingOracle), api.clone());

        let response = assistant.handle("show me the p&l", "c").await;
        assert_eq!(response.kind, ResponseType::Error);
        assert!(!response.message.contains("tokenizer"));
        assert!(api.statements().is_empty());
        assert_eq!(audit.entries_for("interpret")[0].result, "error: internal");
        assert_eq!(assistant.memory.recent("c", 10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_history_flows_to_oracle() {
        let api = Arc::new(StubAccountingApi::locked());
        let oracle = Arc::new(BrokenOracle::default());
        let (assistant, _) = assistant(oracle.clone(), api);

        assistant.handle("first", "c").await;
        assistant.handle("second", "c").await;
        assistant.handle("elsewhere", "other").await;

        assert_eq!(*oracle.seen_history.lock().unwrap(), vec![0, 2, 0]);

        assert!(assistant.forget("c").await);
        assistant.handle("again", "c").await;
        assert_eq!(oracle.seen_history.lock().unwrap().last(), Some(&0));
    }
}
