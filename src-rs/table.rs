//! The editable results table shown after an analysis.

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::inference::CoverageReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalState {
    Normal,
    /// The rows do not add up to 100%.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub label: String,
    /// Read-only, as rendered from the report (`"60%"`).
    pub percent_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultTable {
    rows: Vec<TableRow>,
    total: u32,
}

impl ResultTable {
    pub fn render(report: &CoverageReport) -> Self {
        let rows = report
            .items
            .iter()
            .map(|item| TableRow {
                label: item.label.clone(),
                percent_text: format!("{}%", item.percentage),
            })
            .collect();
        Self {
            rows,
            total: report.total(),
        }
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total computed when the table was rendered. Label edits leave it alone.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn total_text(&self) -> String {
        format!("{}%", self.total)
    }

    pub fn total_state(&self) -> TotalState {
        if self.total == 100 {
            TotalState::Normal
        } else {
            TotalState::Warning
        }
    }

    /// Replace the label of row `index` (zero-based).
    pub fn set_label(&mut self, index: usize, label: &str) -> Result<()> {
        let len = self.rows.len();
        let row = self
            .rows
            .get_mut(index)
            .ok_or(AppError::RowOutOfRange { index, len })?;
        row.label = label.to_string();
        Ok(())
    }

    /// Plain-text rendering for the terminal, rows numbered from 1.
    pub fn to_text(&self) -> String {
        const HEADERS: [&str; 3] = ["#", "Item", "Ratio (%)"];

        let numbers: Vec<String> = (1..=self.rows.len()).map(|n| n.to_string()).collect();
        let num_w = numbers
            .iter()
            .map(|s| display_width(s))
            .max()
            .unwrap_or(0)
            .max(HEADERS[0].len());
        let label_w = self
            .rows
            .iter()
            .map(|row| display_width(&row.label))
            .max()
            .unwrap_or(0)
            .max(HEADERS[1].len())
            .max("Total".len());
        let pct_w = self
            .rows
            .iter()
            .map(|row| display_width(&row.percent_text))
            .chain(std::iter::once(display_width(&self.total_text())))
            .max()
            .unwrap_or(0)
            .max(HEADERS[2].len());

        let line = |num: &str, label: &str, pct: &str| {
            format!(
                "{}  {}  {}",
                pad_left(num, num_w),
                pad_right(label, label_w),
                pad_left(pct, pct_w)
            )
        };

        let header = line(HEADERS[0], HEADERS[1], HEADERS[2]);
        let divider = "-".repeat(display_width(&header));
        let mut lines = vec![header, divider.clone()];
        for (num, row) in numbers.iter().zip(&self.rows) {
            lines.push(line(num, &row.label, &row.percent_text));
        }
        lines.push(divider);
        let mut total_line = line("", "Total", &self.total_text());
        if self.total_state() == TotalState::Warning {
            total_line.push_str("  [warning: total is not 100%]");
        }
        lines.push(total_line);
        lines.join("\n")
    }
}

/// Terminal columns occupied by `text`; Hangul and other wide scripts take two.
fn display_width(text: &str) -> usize {
    text.chars().map(|ch| if is_wide(ch) { 2 } else { 1 }).sum()
}

fn is_wide(ch: char) -> bool {
    matches!(ch as u32,
        0x1100..=0x115F
        | 0x2E80..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6)
}

fn pad_right(text: &str, width: usize) -> String {
    let pad = width.saturating_sub(display_width(text));
    format!("{text}{}", " ".repeat(pad))
}

fn pad_left(text: &str, width: usize) -> String {
    let pad = width.saturating_sub(display_width(text));
    format!("{}{text}", " ".repeat(pad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{parse_response, CoverageItem};
    use pretty_assertions::assert_eq;

    fn report(items: &[(&str, u32)]) -> CoverageReport {
        CoverageReport {
            items: items
                .iter()
                .map(|(label, pct)| CoverageItem::new(*label, *pct))
                .collect(),
        }
    }

    #[test]
    fn parsed_fenced_answer_renders_normal_total() {
        let parsed = parse_response(
            "```json\n[{\"name\":\"잔디\",\"percentage\":60},{\"name\":\"토끼풀\",\"percentage\":40}]\n```",
        )
        .unwrap();
        let table = ResultTable::render(&parsed);
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_text(), "100%");
        assert_eq!(table.total_state(), TotalState::Normal);
        assert_eq!(table.rows()[0].percent_text, "60%");
    }

    #[test]
    fn short_total_is_flagged() {
        let table = ResultTable::render(&report(&[("lawn", 50), ("paving", 40)]));
        assert_eq!(table.total_text(), "90%");
        assert_eq!(table.total_state(), TotalState::Warning);
        assert!(table.to_text().contains("[warning: total is not 100%]"));
    }

    #[test]
    fn label_edits_do_not_touch_percentages_or_total() {
        let mut table = ResultTable::render(&report(&[("lawn", 70), ("clover", 30)]));
        table.set_label(1, "white clover").unwrap();
        assert_eq!(
            table.rows()[1],
            TableRow {
                label: "white clover".to_string(),
                percent_text: "30%".to_string(),
            }
        );
        assert_eq!(table.total(), 100);
    }

    #[test]
    fn out_of_range_edit_is_rejected() {
        let mut table = ResultTable::render(&report(&[("lawn", 100)]));
        let err = table.set_label(3, "x").unwrap_err();
        assert!(matches!(err, AppError::RowOutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn duplicates_and_odd_values_are_kept_as_given() {
        let table = ResultTable::render(&report(&[("lawn", 150), ("lawn", 0)]));
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_text(), "150%");
    }

    #[test]
    fn text_rendering_aligns_wide_labels() {
        let table = ResultTable::render(&report(&[("잔디", 60), ("bare", 40)]));
        let text = table.to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(display_width(lines[2]), display_width(lines[3]));
        assert!(lines[2].ends_with("60%"));
        assert!(lines.last().unwrap().ends_with("100%"));
    }
}
