//! Spreadsheet-like data sink
//!
//! Destinations use A1 notation: `Summary`, `Summary!B2`, `Summary!A1:C9`,
//! `'Q1 Budget'!A1`. A bare sheet name addresses the whole sheet.

use crate::error::LedgerError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of a sink call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteSummary {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
}

impl WriteSummary {
    pub fn new(row_count: usize, column_count: usize) -> Self {
        Self {
            success: true,
            row_count,
            column_count,
        }
    }
}

#[async_trait]
pub trait DataSink: Send + Sync {
    /// Write rows starting at the destination's top-left cell
    async fn write(&self, destination: &Destination, rows: &[Vec<String>]) -> Result<WriteSummary>;

    /// Create a new sheet. `options.headers` seeds the first row.
    async fn create_artifact(&self, name: &str, options: &Value) -> Result<WriteSummary>;

    async fn clear_range(&self, destination: &Destination) -> Result<WriteSummary>;

    /// Append rows below the last non-empty row of a sheet
    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<WriteSummary>;
}

// ================= Destinations =================

/// Largest addressable sheet, matching common spreadsheet limits
pub const MAX_ROWS: usize = 1_048_576;
pub const MAX_COLUMNS: usize = 16_384;

/// Zero-based cell coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

impl Cell {
    pub fn parse(s: &str) -> Result<Cell> {
        let s = s.trim();
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| invalid_cell(s))?;
        let (letters, digits) = s.split_at(split);

        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid_cell(s));
        }
        let row: usize = digits.parse().map_err(|_| invalid_cell(s))?;
        if row == 0 || row > MAX_ROWS {
            return Err(invalid_cell(s));
        }

        let col = letters
            .to_ascii_uppercase()
            .bytes()
            .try_fold(0usize, |acc, b| {
                acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize)
            })
            .filter(|col| *col <= MAX_COLUMNS)
            .ok_or_else(|| invalid_cell(s))?;

        Ok(Cell {
            row: row - 1,
            col: col - 1,
        })
    }

    pub fn column_letters(&self) -> String {
        let mut n = self.col + 1;
        let mut letters = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        letters.iter().rev().collect()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column_letters(), self.row + 1)
    }
}

fn invalid_cell(s: &str) -> LedgerError {
    LedgerError::ValidationError(format!("Invalid cell reference: '{}'", s))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub sheet: String,
    pub start: Option<Cell>,
    pub end: Option<Cell>,
}

impl Destination {
    pub fn parse(locator: &str) -> Result<Destination> {
        let locator = locator.trim();
        let (sheet, range) = match locator.rsplit_once('!') {
            Some((sheet, range)) => (sheet, Some(range.trim())),
            None => (locator, None),
        };

        let sheet = sheet.trim().trim_matches('\'').trim();
        if sheet.is_empty() {
            return Err(LedgerError::ValidationError(format!(
                "Destination '{}' names no sheet",
                locator
            )));
        }

        let (start, end) = match range.filter(|r| !r.is_empty()) {
            None => (None, None),
            Some(range) => match range.split_once(':') {
                Some((a, b)) => {
                    let (a, b) = (Cell::parse(a)?, Cell::parse(b)?);
                    let top_left = Cell {
                        row: a.row.min(b.row),
                        col: a.col.min(b.col),
                    };
                    let bottom_right = Cell {
                        row: a.row.max(b.row),
                        col: a.col.max(b.col),
                    };
                    (Some(top_left), Some(bottom_right))
                }
                None => (Some(Cell::parse(range)?), None),
            },
        };

        Ok(Destination {
            sheet: sheet.to_string(),
            start,
            end,
        })
    }

    pub fn anchor(&self) -> Cell {
        self.start.unwrap_or(Cell { row: 0, col: 0 })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sheet.contains(' ') {
            write!(f, "'{}'", self.sheet)?;
        } else {
            write!(f, "{}", self.sheet)?;
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => write!(f, "!{}:{}", start, end),
            (Some(start), None) => write!(f, "!{}", start),
            _ => Ok(()),
        }
    }
}

fn grid_width(rows: &[Vec<String>]) -> usize {
    rows.iter().map(Vec::len).max().unwrap_or(0)
}

/// Reject blocks that would grow a sheet past its limits
fn check_bounds(sheet: &str, first_row: usize, first_col: usize, rows: &[Vec<String>]) -> Result<()> {
    if first_row + rows.len() > MAX_ROWS || first_col + grid_width(rows) > MAX_COLUMNS {
        return Err(LedgerError::ValidationError(format!(
            "Writing {} rows to '{}' exceeds the sheet size limit",
            rows.len(),
            sheet
        )));
    }
    Ok(())
}

// ================= In-memory sink =================

type Grid = Vec<Vec<String>>;

/// Grid store keyed by sheet name. Writes auto-create sheets.
#[derive(Default)]
pub struct InMemorySheetSink {
    sheets: RwLock<HashMap<String, Grid>>,
}

impl InMemorySheetSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sheet(&self, name: &str) -> Option<Grid> {
        self.sheets.read().await.get(name).cloned()
    }

    pub async fn sheet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sheets.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn put(grid: &mut Grid, row: usize, col: usize, value: String) {
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let line = &mut grid[row];
    if line.len() <= col {
        line.resize(col + 1, String::new());
    }
    line[col] = value;
}

#[async_trait]
impl DataSink for InMemorySheetSink {
    async fn write(&self, destination: &Destination, rows: &[Vec<String>]) -> Result<WriteSummary> {
        let anchor = destination.anchor();
        check_bounds(&destination.sheet, anchor.row, anchor.col, rows)?;
        let mut sheets = self.sheets.write().await;
        let grid = sheets.entry(destination.sheet.clone()).or_default();

        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                put(grid, anchor.row + r, anchor.col + c, value.clone());
            }
        }

        debug!("Wrote {} rows to {}", rows.len(), destination);
        Ok(WriteSummary::new(rows.len(), grid_width(rows)))
    }

    async fn create_artifact(&self, name: &str, options: &Value) -> Result<WriteSummary> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::ValidationError("Sheet name is empty".to_string()));
        }

        let mut sheets = self.sheets.write().await;
        if sheets.contains_key(name) {
            return Err(LedgerError::ValidationError(format!(
                "Sheet '{}' already exists",
                name
            )));
        }

        let headers: Vec<String> = options
            .get("headers")
            .and_then(Value::as_array)
            .map(|cells| {
                cells
                    .iter()
                    .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let summary = if headers.is_empty() {
            WriteSummary::new(0, 0)
        } else {
            WriteSummary::new(1, headers.len())
        };
        let grid = if headers.is_empty() { Vec::new() } else { vec![headers] };
        sheets.insert(name.to_string(), grid);

        Ok(summary)
    }

    async fn clear_range(&self, destination: &Destination) -> Result<WriteSummary> {
        let mut sheets = self.sheets.write().await;
        let grid = sheets.get_mut(&destination.sheet).ok_or_else(|| {
            LedgerError::NotFound(format!("Sheet '{}' does not exist", destination.sheet))
        })?;

        let Some(start) = destination.start else {
            let summary = WriteSummary::new(grid.len(), grid_width(grid));
            grid.clear();
            return Ok(summary);
        };
        let end = destination.end.unwrap_or(start);

        for row in grid.iter_mut().take(end.row + 1).skip(start.row) {
            for cell in row.iter_mut().take(end.col + 1).skip(start.col) {
                cell.clear();
            }
        }

        Ok(WriteSummary::new(
            end.row - start.row + 1,
            end.col - start.col + 1,
        ))
    }

    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<WriteSummary> {
        let mut sheets = self.sheets.write().await;
        let grid = sheets
            .get_mut(sheet)
            .ok_or_else(|| LedgerError::NotFound(format!("Sheet '{}' does not exist", sheet)))?;

        let last_used = grid
            .iter()
            .rposition(|row| row.iter().any(|c| !c.is_empty()))
            .map(|i| i + 1)
            .unwrap_or(0);
        check_bounds(sheet, last_used, 0, rows)?;
        grid.truncate(last_used);
        grid.extend(rows.iter().cloned());

        Ok(WriteSummary::new(rows.len(), grid_width(rows)))
    }
}
