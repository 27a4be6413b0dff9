//! Plain-text rendering of a batch for the `preview` command.

use std::fmt::Write as _;

use crate::batch::Batch;

const NULL_CELL: &str = "<null>";
const MAX_CELL_WIDTH: usize = 40;

pub fn render_batch(batch: &Batch) -> String {
    let headers = batch.columns().iter().map(|h| clip(h)).collect::<Vec<_>>();
    let cells = batch
        .rows()
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Some(value) => clip(&value.as_display()),
                    None => NULL_CELL.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut widths = headers.iter().map(|h| h.chars().count()).collect::<Vec<_>>();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", join_padded(&headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat((*w).max(3))).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", join_padded(&rule, &widths));
    for row in &cells {
        let _ = writeln!(output, "{}", join_padded(row, &widths));
    }
    output
}

pub fn print_batch(batch: &Batch) {
    print!("{}", render_batch(batch));
}

fn join_padded(cells: &[String], widths: &[usize]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

/// One display line, at most `MAX_CELL_WIDTH` characters.
fn clip(value: &str) -> String {
    let flat = value.replace(['\n', '\r', '\t'], " ");
    if flat.chars().count() <= MAX_CELL_WIDTH {
        flat
    } else {
        let mut clipped = flat.chars().take(MAX_CELL_WIDTH - 1).collect::<String>();
        clipped.push('…');
        clipped
    }
}
