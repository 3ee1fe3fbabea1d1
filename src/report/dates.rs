//! Date handling for report ranges

use chrono::{DateTime, Datelike, Months, NaiveDate};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn start_str(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

/// Parse the date spellings users and oracles produce.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in [DATE_FORMAT, "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive())
}

/// Re-render a date as `YYYY-MM-DD`, or `None` when unparseable
pub fn normalize_date(input: &str) -> Option<String> {
    parse_date(input).map(|d| d.format(DATE_FORMAT).to_string())
}

pub fn month_range(year: i32, month: u32) -> Option<DateRange> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
    Some(DateRange { start, end })
}

pub fn current_month(today: NaiveDate) -> DateRange {
    month_range(today.year(), today.month()).unwrap_or(DateRange {
        start: today,
        end: today,
    })
}

pub fn previous_month(today: NaiveDate) -> DateRange {
    let anchor = today
        .with_day(1)
        .and_then(|d| d.checked_sub_months(Months::new(1)))
        .unwrap_or(today);
    current_month(anchor)
}

pub fn full_year(year: i32) -> DateRange {
    let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MIN);
    let end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(NaiveDate::MAX);
    DateRange { start, end }
}

fn quarter_range(year: i32, quarter: u32) -> Option<DateRange> {
    let first = month_range(year, (quarter - 1) * 3 + 1)?;
    let last = month_range(year, quarter * 3)?;
    Some(DateRange {
        start: first.start,
        end: last.end,
    })
}

fn quarter_of(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

/// Resolve a report's date inputs. Both dates must parse; otherwise the
/// full current year is used.
pub fn resolve_range(start: &str, end: &str, today: NaiveDate) -> (DateRange, bool) {
    match (parse_date(start), parse_date(end)) {
        (Some(s), Some(e)) if s <= e => (DateRange { start: s, end: e }, false),
        _ => (full_year(today.year()), true),
    }
}

/// Recognise relative period phrases in free text
pub fn infer_period(text: &str, today: NaiveDate) -> Option<DateRange> {
    let t = text.to_lowercase();
    let has = |phrases: &[&str]| phrases.iter().any(|p| t.contains(p));

    if has(&["last month", "previous month", "prior month"]) {
        return Some(previous_month(today));
    }
    if has(&["this month", "current month", "month to date", "mtd"]) {
        return Some(current_month(today));
    }
    if has(&["last quarter", "previous quarter", "prior quarter"]) {
        let q = quarter_of(today);
        return if q == 1 {
            quarter_range(today.year() - 1, 4)
        } else {
            quarter_range(today.year(), q - 1)
        };
    }
    if has(&["this quarter", "current quarter"]) {
        return quarter_range(today.year(), quarter_of(today));
    }
    if has(&["last year", "previous year", "prior year"]) {
        return Some(full_year(today.year() - 1));
    }
    if has(&["year to date", "ytd"]) {
        return Some(DateRange {
            start: full_year(today.year()).start,
            end: today,
        });
    }
    if has(&["this year", "current year"]) {
        return Some(full_year(today.year()));
    }
    None
}
