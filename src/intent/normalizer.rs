//! Intent normalization
//!
//! Pure transformation from an oracle's raw guess to a validated `Intent`.
//! No I/O. Normalizing an already-normalized intent is a no-op.

use crate::models::{Intent, IntentKind, RawIntent};
use crate::report::dates::{current_month, infer_period, normalize_date};
use crate::report::ReportKind;
use chrono::NaiveDate;
use serde_json::{json, Value};

pub const ACTION_REPORT: &str = "report";
pub const ACTION_QUERY: &str = "query";
pub const ACTION_ENTITY: &str = "entity";
pub const ACTION_CREATE_ARTIFACT: &str = "createArtifact";
pub const ACTION_UPDATE_DESTINATION: &str = "updateDestination";
pub const ACTION_ADD_ROW: &str = "addRow";
pub const ACTION_CLEAR_RANGE: &str = "clearRange";

pub const PLACEHOLDER_NAME: &str = "New Sheet";

pub const START_DATE: &str = "startDate";
pub const END_DATE: &str = "endDate";

const START_ALIASES: [&str; 4] = ["start_date", "startdate", "from", "start"];
const END_ALIASES: [&str; 4] = ["end_date", "enddate", "to", "end"];
const NAME_ALIASES: [&str; 3] = ["sheetName", "title", "artifactName"];

/// Record types of the accounting API, in their canonical spelling
pub const KNOWN_ENTITIES: [&str; 24] = [
    "Account",
    "Bill",
    "BillPayment",
    "Class",
    "CreditMemo",
    "Customer",
    "Department",
    "Deposit",
    "Employee",
    "Estimate",
    "Invoice",
    "Item",
    "JournalEntry",
    "Payment",
    "Purchase",
    "PurchaseOrder",
    "RefundReceipt",
    "SalesReceipt",
    "TaxCode",
    "Term",
    "TimeActivity",
    "Transfer",
    "Vendor",
    "VendorCredit",
];

pub fn normalize(raw: RawIntent, query: &str, today: NaiveDate) -> Intent {
    let mut intent = Intent {
        kind: raw
            .kind
            .as_deref()
            .map(IntentKind::parse)
            .unwrap_or_default(),
        action: clean(raw.action),
        entity: clean(raw.entity),
        filters: raw.filters.unwrap_or_default(),
        destination: non_empty(raw.destination),
        parameters: raw.parameters.unwrap_or_default(),
        raw_api_call: non_empty(raw.raw_api_call).map(|p| normalize_api_path(&p)),
        raw_method: non_empty(raw.raw_method).map(|m| m.to_uppercase()),
        raw_payload: raw.raw_payload.filter(|v| !v.is_null()),
        explanation: clean(raw.explanation),
        defaults_applied: raw.defaults_applied.unwrap_or(false),
    };

    if intent.kind == IntentKind::Unknown && intent.has_raw_override() {
        intent.kind = IntentKind::Custom;
    }

    match intent.kind {
        IntentKind::Fetch => normalize_fetch(&mut intent, query, today),
        IntentKind::Create => normalize_create(&mut intent, query),
        IntentKind::Modify => normalize_modify(&mut intent),
        IntentKind::Custom => {
            if intent.raw_method.is_none() {
                let method = if intent.raw_payload.is_some() { "POST" } else { "GET" };
                intent.raw_method = Some(method.to_string());
            }
        }
        IntentKind::Help | IntentKind::Diagnostic | IntentKind::Unknown => {}
    }

    if let Some(destination) = &intent.destination {
        intent
            .parameters
            .entry("destination".to_string())
            .or_insert_with(|| json!(destination));
    }

    if intent.explanation.is_empty() {
        intent.explanation = explain(&intent);
    }

    intent
}

fn clean(value: Option<String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Ensure a leading `/`. Absolute URLs are left for the dispatcher to reject.
pub fn normalize_api_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') || path.contains("://") {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Canonical spelling of an accounting entity: case-insensitive, plural tolerant
pub fn canonical_entity(name: &str) -> Option<&'static str> {
    let key: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if key.is_empty() {
        return None;
    }

    KNOWN_ENTITIES.iter().copied().find(|entity| {
        let e = entity.to_lowercase();
        key == e || key == format!("{}s", e) || key == format!("{}es", e)
    })
}

/// First known entity mentioned in free text
pub fn detect_entity(text: &str) -> Option<&'static str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .find_map(canonical_entity)
}

fn normalize_fetch(intent: &mut Intent, query: &str, today: NaiveDate) {
    let action = intent.action.to_lowercase();
    intent.action = match action.as_str() {
        "report" | "reports" | "fetchreport" => ACTION_REPORT.to_string(),
        "query" | "list" | "search" | "find" => ACTION_QUERY.to_string(),
        "entity" | "record" | "getentity" => ACTION_ENTITY.to_string(),
        "" => {
            let looks_like_record = !intent.entity.is_empty()
                && ReportKind::parse(&intent.entity).is_none()
                && canonical_entity(&intent.entity).is_some();
            if looks_like_record {
                ACTION_QUERY.to_string()
            } else {
                ACTION_REPORT.to_string()
            }
        }
        _ => intent.action.clone(),
    };

    match intent.action.as_str() {
        ACTION_REPORT => normalize_report(intent, query, today),
        ACTION_QUERY | ACTION_ENTITY => {
            if intent.entity.is_empty() {
                if let Some(entity) = detect_entity(query) {
                    intent.entity = entity.to_string();
                }
            } else if let Some(entity) = canonical_entity(&intent.entity) {
                intent.entity = entity.to_string();
            }
        }
        _ => {}
    }
}

fn normalize_report(intent: &mut Intent, query: &str, today: NaiveDate) {
    if let Some(kind) = ReportKind::parse(&intent.entity) {
        intent.entity = kind.api_name().to_string();
    } else if intent.entity.is_empty() {
        let kind = ReportKind::detect(query).unwrap_or(ReportKind::ProfitAndLoss);
        intent.entity = kind.api_name().to_string();
    }

    adopt_alias(intent, START_DATE, &START_ALIASES);
    adopt_alias(intent, END_DATE, &END_ALIASES);

    let start = intent.filter_str(START_DATE).map(str::to_string);
    let end = intent.filter_str(END_DATE).map(str::to_string);

    match (start, end) {
        (Some(start), Some(end)) => {
            let start = normalize_date(&start).unwrap_or_else(|| start.trim().to_string());
            let end = normalize_date(&end).unwrap_or_else(|| end.trim().to_string());
            intent.filters.insert(START_DATE.to_string(), json!(start));
            intent.filters.insert(END_DATE.to_string(), json!(end));
        }
        _ => {
            let range = match infer_period(query, today) {
                Some(range) => range,
                None => {
                    intent.defaults_applied = true;
                    current_month(today)
                }
            };
            intent.filters.insert(START_DATE.to_string(), json!(range.start_str()));
            intent.filters.insert(END_DATE.to_string(), json!(range.end_str()));
        }
    }
}

/// Move the first alias key's value under `canonical` when it is absent
fn adopt_alias(intent: &mut Intent, canonical: &str, aliases: &[&str]) {
    for alias in aliases {
        if let Some(value) = intent.filters.remove(*alias) {
            if intent.filter_str(canonical).is_none() {
                intent.filters.insert(canonical.to_string(), value);
            }
        }
    }
}

fn normalize_create(intent: &mut Intent, query: &str) {
    let action = intent.action.to_lowercase();
    if matches!(
        action.as_str(),
        "" | "createartifact" | "createsheet" | "create_sheet" | "sheet" | "newsheet" | "addsheet"
    ) {
        intent.action = ACTION_CREATE_ARTIFACT.to_string();
    }

    if intent.action != ACTION_CREATE_ARTIFACT {
        return;
    }

    if intent.param_str("name").is_none() {
        let from_alias = NAME_ALIASES
            .iter()
            .find_map(|key| intent.param_str(key).map(str::to_string));
        let name = from_alias
            .or_else(|| extract_name(query))
            .unwrap_or_else(|| PLACEHOLDER_NAME.to_string());
        intent.parameters.insert("name".to_string(), json!(name));
    }
}

fn normalize_modify(intent: &mut Intent) {
    let action = intent.action.to_lowercase();
    intent.action = match action.as_str() {
        "addrow" | "add_row" | "appendrow" | "append" => ACTION_ADD_ROW.to_string(),
        "clearrange" | "clear_range" | "clear" => ACTION_CLEAR_RANGE.to_string(),
        "updatedestination" | "updaterange" | "writedata" | "write" | "update" => {
            ACTION_UPDATE_DESTINATION.to_string()
        }
        "" if intent.destination.is_some() => ACTION_UPDATE_DESTINATION.to_string(),
        _ => intent.action.clone(),
    };
}

/// Pull an artifact name out of the query: a quoted string first, then the
/// words after "named", "called" or "titled".
pub fn extract_name(query: &str) -> Option<String> {
    for (open, close) in [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}')] {
        if let Some(start) = query.find(open) {
            let rest = &query[start + open.len_utf8()..];
            if let Some(end) = rest.find(close) {
                let name = rest[..end].trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }

    for keyword in [" named ", " called ", " titled "] {
        if let Some(idx) = rfind_ignore_ascii_case(query, keyword) {
            let name = query[idx + keyword.len()..]
                .trim()
                .trim_end_matches(|c: char| c.is_ascii_punctuation())
                .trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    None
}

/// Byte offset of the last ASCII-case-insensitive match of `needle`.
/// Offsets index `haystack` itself, so slicing at them is safe.
fn rfind_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .char_indices()
        .rev()
        .map(|(i, _)| i)
        .find(|&i| {
            haystack
                .get(i..i + needle.len())
                .is_some_and(|window| window.eq_ignore_ascii_case(needle))
        })
}

fn explain(intent: &Intent) -> String {
    let target = intent
        .destination
        .as_deref()
        .map(|d| format!(" and write it to {}", d))
        .unwrap_or_default();

    match intent.kind {
        IntentKind::Fetch => match intent.action.as_str() {
            ACTION_REPORT => {
                let title = ReportKind::parse(&intent.entity)
                    .map(|k| k.title().to_string())
                    .unwrap_or_else(|| intent.entity.clone());
                format!(
                    "Fetch the {} report from {} to {}{}",
                    title,
                    intent.filter_str(START_DATE).unwrap_or("?"),
                    intent.filter_str(END_DATE).unwrap_or("?"),
                    target
                )
            }
            ACTION_ENTITY => format!("Fetch a {} record{}", entity_label(intent), target),
            _ => format!("Query {} records{}", entity_label(intent), target),
        },
        IntentKind::Create => match intent.param_str("name") {
            Some(name) => format!("Create a sheet named '{}'", name),
            None => format!("Create: {}", intent.action),
        },
        IntentKind::Modify => {
            let where_ = intent.destination.as_deref().unwrap_or("the active sheet");
            match intent.action.as_str() {
                ACTION_ADD_ROW => format!("Append a row to {}", where_),
                ACTION_CLEAR_RANGE => format!("Clear {}", where_),
                ACTION_UPDATE_DESTINATION => format!("Write values to {}", where_),
                other => format!("Modify {} ({})", where_, other),
            }
        }
        IntentKind::Help => "Show what this assistant can do".to_string(),
        IntentKind::Diagnostic => "Run connection diagnostics against the accounting service".to_string(),
        IntentKind::Custom => format!(
            "Call {} {} directly",
            intent.raw_method.as_deref().unwrap_or("GET"),
            intent.raw_api_call.as_deref().unwrap_or("/")
        ),
        IntentKind::Unknown => "Request not understood; showing available commands".to_string(),
    }
}

fn entity_label(intent: &Intent) -> &str {
    if intent.entity.is_empty() {
        "accounting"
    } else {
        &intent.entity
    }
}

/// Convenience for values stored in filters/parameters
pub fn value_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn raw(kind: &str, action: &str) -> RawIntent {
        RawIntent {
            kind: Some(kind.to_string()),
            action: Some(action.to_string()),
            ..RawIntent::default()
        }
    }

    fn assert_idempotent(intent: &Intent, query: &str) {
        let again = normalize(RawIntent::from(intent.clone()), query, today());
        assert_eq!(&again, intent);
    }

    #[test]
    fn test_empty_guess_is_unknown() {
        let intent = normalize(RawIntent::default(), "hello", today());
        assert_eq!(intent.kind, IntentKind::Unknown);
        assert_eq!(intent.action, "");
        assert_eq!(intent.entity, "");
        assert!(intent.filters.is_empty());
        assert!(intent.parameters.is_empty());
        assert!(!intent.explanation.is_empty());
        assert_idempotent(&intent, "hello");
    }

    #[test]
    fn test_report_defaults_to_current_month() {
        let intent = normalize(raw("fetch", "report"), "show me the p&l", today());
        assert_eq!(intent.entity, "ProfitAndLoss");
        assert_eq!(intent.filter_str(START_DATE), Some("2024-03-01"));
        assert_eq!(intent.filter_str(END_DATE), Some("2024-03-31"));
        assert!(intent.defaults_applied);
        assert_idempotent(&intent, "show me the p&l");
    }

    #[test]
    fn test_last_month_from_query_text() {
        let query = "Fetch profit and loss report for last month";
        let intent = normalize(raw("fetch", "report"), query, today());
        assert_eq!(intent.entity, "ProfitAndLoss");
        assert_eq!(intent.filter_str(START_DATE), Some("2024-02-01"));
        assert_eq!(intent.filter_str(END_DATE), Some("2024-02-29"));
        assert!(!intent.defaults_applied);
        assert_idempotent(&intent, query);
    }

    #[test]
    fn test_half_range_is_replaced() {
        let mut filters = BTreeMap::new();
        filters.insert("startDate".to_string(), json!("2024-01-01"));
        let guess = RawIntent {
            filters: Some(filters),
            ..raw("fetch", "report")
        };

        let intent = normalize(guess, "balance sheet", today());
        assert_eq!(intent.entity, "BalanceSheet");
        assert_eq!(intent.filter_str(START_DATE), Some("2024-03-01"));
        assert_eq!(intent.filter_str(END_DATE), Some("2024-03-31"));
    }

    #[test]
    fn test_explicit_dates_are_reformatted() {
        let mut filters = BTreeMap::new();
        filters.insert("start_date".to_string(), json!("01/15/2024"));
        filters.insert("endDate".to_string(), json!("2024/02/10"));
        let guess = RawIntent {
            entity: Some("P&L".to_string()),
            filters: Some(filters),
            ..raw("fetch", "")
        };

        let intent = normalize(guess, "", today());
        assert_eq!(intent.action, ACTION_REPORT);
        assert_eq!(intent.filter_str(START_DATE), Some("2024-01-15"));
        assert_eq!(intent.filter_str(END_DATE), Some("2024-02-10"));
        assert!(!intent.filters.contains_key("start_date"));
        assert!(!intent.defaults_applied);
        assert_idempotent(&intent, "");
    }

    #[test]
    fn test_record_fetch_infers_query_action() {
        let guess = RawIntent {
            entity: Some("customers".to_string()),
            ..raw("fetch", "")
        };
        let intent = normalize(guess, "list customers", today());
        assert_eq!(intent.action, ACTION_QUERY);
        assert_eq!(intent.entity, "Customer");
        assert!(!intent.filters.contains_key(START_DATE));
    }

    #[test]
    fn test_raw_override_promotes_unknown() {
        let guess = RawIntent {
            raw_api_call: Some("companyinfo/123".to_string()),
            ..RawIntent::default()
        };
        let intent = normalize(guess, "", today());
        assert_eq!(intent.kind, IntentKind::Custom);
        assert_eq!(intent.raw_api_call.as_deref(), Some("/companyinfo/123"));
        assert_eq!(intent.raw_method.as_deref(), Some("GET"));
        assert_idempotent(&intent, "");
    }

    #[test]
    fn test_destination_infers_write_action() {
        let guess = RawIntent {
            destination: Some(" Summary!A1 ".to_string()),
            parameters: Some(BTreeMap::from([("values".to_string(), json!([["a", 1]]))])),
            ..raw("modify", "")
        };
        let intent = normalize(guess, "", today());
        assert_eq!(intent.action, ACTION_UPDATE_DESTINATION);
        assert_eq!(intent.destination.as_deref(), Some("Summary!A1"));
        assert_eq!(intent.param_str("destination"), Some("Summary!A1"));
        assert_idempotent(&intent, "");
    }

    #[test]
    fn test_create_name_extraction() {
        let intent = normalize(raw("create", ""), "create a sheet called Q1 Budget.", today());
        assert_eq!(intent.action, ACTION_CREATE_ARTIFACT);
        assert_eq!(intent.param_str("name"), Some("Q1 Budget"));

        let quoted = normalize(raw("create", "createSheet"), "make \"Cash Plan\" now", today());
        assert_eq!(quoted.param_str("name"), Some("Cash Plan"));

        let generic = normalize(raw("create", ""), "create a new sheet", today());
        assert_eq!(generic.param_str("name"), Some(PLACEHOLDER_NAME));
        assert_idempotent(&generic, "create a new sheet");
    }

    #[test]
    fn test_name_extraction_with_non_ascii_text() {
        let query = "İstanbul create a sheet named Şube";
        let intent = normalize(raw("create", ""), query, today());
        assert_eq!(intent.param_str("name"), Some("Şube"));

        assert_eq!(extract_name("İİİ NAMED Ünye Kasa"), Some("Ünye Kasa".to_string()));
        assert_eq!(extract_name("ŞŞŞ sheet"), None);
    }

    #[test]
    fn test_oracle_explanation_is_kept() {
        let guess = RawIntent {
            explanation: Some("Pulling your P&L".to_string()),
            ..raw("fetch", "report")
        };
        let intent = normalize(guess, "", today());
        assert_eq!(intent.explanation, "Pulling your P&L");
    }

    #[test]
    fn test_report_dates_share_the_test_month() {
        for query in ["", "report please", "numbers"] {
            let intent = normalize(raw("fetch", "report"), query, today());
            let start = intent.filter_str(START_DATE).unwrap();
            let end = intent.filter_str(END_DATE).unwrap();
            assert!(start.starts_with("2024-03"));
            assert!(end.starts_with("2024-03"));
        }
    }

    #[test]
    fn test_canonical_entity() {
        assert_eq!(canonical_entity("invoices"), Some("Invoice"));
        assert_eq!(canonical_entity("SALESRECEIPT"), Some("SalesReceipt"));
        assert_eq!(canonical_entity("classes"), Some("Class"));
        assert_eq!(canonical_entity("spaceship"), None);
        assert_eq!(detect_entity("show all vendors in Texas"), Some("Vendor"));
    }
}
