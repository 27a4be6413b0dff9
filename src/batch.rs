//! Materialized row windows and their bulk-load text encoding.
//!
//! The text encoding writes one line per row, fields joined by the delimiter,
//! nulls replaced by the null marker. Nothing is quoted or escaped: a value
//! that contains the delimiter or a line break shifts or splits its row. The
//! tables fed by this encoding were built against that behaviour, so it is
//! kept as is.

use crate::data::Value;

pub type Row = Vec<Option<Value>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Batch {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn empty(columns: Vec<String>) -> Self {
        Self::new(columns, Vec::new())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Values of one column rendered as text, nulls as `None`.
    pub fn text_column(&self, name: &str) -> Option<Vec<Option<String>>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).cloned().flatten().map(|v| v.as_display()))
                .collect(),
        )
    }

    pub fn encode_text(&self, delimiter: u8, null_marker: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rows.len() * self.columns.len() * 8);
        for row in &self.rows {
            for (idx, cell) in row.iter().enumerate() {
                if idx > 0 {
                    out.push(delimiter);
                }
                match cell {
                    Some(value) => out.extend_from_slice(value.as_display().as_bytes()),
                    None => out.extend_from_slice(null_marker.as_bytes()),
                }
            }
            out.push(b'\n');
        }
        out
    }
}
