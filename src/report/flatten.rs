//! Report tree flattening
//!
//! Depth-first, document order. Every emitted row is padded or truncated to
//! the header width.

use super::tree::{ReportRow, ReportTree};
use crate::models::Table;

const DEFAULT_HEADERS: [&str; 2] = ["Account", "Total"];

/// Header list for a tree: its own column titles, or the two-column default
pub fn headers_for(tree: &ReportTree) -> Vec<String> {
    let titled: Vec<String> = tree
        .columns
        .iter()
        .map(|c| c.trim().to_string())
        .collect();

    if titled.is_empty() || titled.iter().all(|c| c.is_empty()) {
        return DEFAULT_HEADERS.iter().map(|s| s.to_string()).collect();
    }
    titled
}

/// Right-pad with empty strings or truncate to `width`
pub fn fit_row(mut cells: Vec<String>, width: usize) -> Vec<String> {
    cells.resize(width, String::new());
    cells
}

pub fn flatten(tree: &ReportTree, headers: &[String]) -> Table {
    let width = headers.len();
    let mut rows = Vec::new();
    for row in &tree.rows {
        flatten_row(row, width, &mut rows);
    }

    Table {
        headers: headers.to_vec(),
        rows,
    }
}

fn flatten_row(row: &ReportRow, width: usize, out: &mut Vec<Vec<String>>) {
    match row {
        ReportRow::Section { header, rows } => {
            if let Some(cells) = header.as_ref().filter(|c| !c.is_empty()) {
                out.push(fit_row(cells.clone(), width));
            }
            for child in rows {
                flatten_row(child, width, out);
            }
        }
        ReportRow::Data { cells, .. } | ReportRow::Summary { cells } => {
            // Nodes with no cells have no recognised shape; skip them.
            if !cells.is_empty() {
                out.push(fit_row(cells.clone(), width));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tree::ReportHeader;

    fn tree(columns: &[&str], rows: Vec<ReportRow>) -> ReportTree {
        ReportTree {
            header: ReportHeader {
                report_name: "ProfitAndLoss".to_string(),
                ..ReportHeader::default()
            },
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    fn nested() -> Vec<ReportRow> {
        vec![
            ReportRow::Section {
                header: Some(vec!["Income".into()]),
                rows: vec![
                    ReportRow::data(["Sales", "100.00", "extra", "more"]),
                    ReportRow::Section {
                        header: Some(vec!["Services".into(), "".into()]),
                        rows: vec![
                            ReportRow::data(["Consulting", "50.00"]),
                            ReportRow::summary(["Total Services", "50.00"]),
                        ],
                    },
                    ReportRow::summary(["Total Income", "150.00"]),
                ],
            },
            ReportRow::Section {
                header: None,
                rows: vec![],
            },
            ReportRow::Data {
                cells: vec![],
                placeholder: false,
            },
            ReportRow::summary(["Net Income", "150.00"]),
        ]
    }

    #[test]
    fn test_document_order() {
        let t = tree(&["Account", "Total"], nested());
        let table = flatten(&t, &headers_for(&t));
        let first: Vec<&str> = table.rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(
            first,
            vec![
                "Income",
                "Sales",
                "Services",
                "Consulting",
                "Total Services",
                "Total Income",
                "Net Income"
            ]
        );
    }

    #[test]
    fn test_every_row_matches_header_width() {
        for columns in [vec!["Account"], vec!["Account", "Total"], vec!["A", "B", "C", "D", "E"]] {
            let t = tree(&columns, nested());
            let headers = headers_for(&t);
            let table = flatten(&t, &headers);
            assert!(!table.rows.is_empty());
            assert!(table.rows.iter().all(|r| r.len() == headers.len()));
        }
    }

    #[test]
    fn test_padding_and_truncation() {
        assert_eq!(fit_row(vec!["a".into()], 3), vec!["a", "", ""]);
        assert_eq!(fit_row(vec!["a".into(), "b".into(), "c".into()], 2), vec!["a", "b"]);
    }

    #[test]
    fn test_default_headers() {
        let t = tree(&[], vec![ReportRow::data(["Rent", "10", "ignored"])]);
        let headers = headers_for(&t);
        assert_eq!(headers, vec!["Account", "Total"]);
        assert_eq!(flatten(&t, &headers).rows, vec![vec!["Rent", "10"]]);
    }
}
