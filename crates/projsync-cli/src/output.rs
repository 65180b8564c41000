use serde::Serialize;

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Widest cell per column, counted in characters so logins and column names
/// with non-ASCII text still line up. Cells beyond the header count are
/// ignored.
fn column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    widths
}

fn render_line<S: AsRef<str>>(cells: &[S], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let width = widths.get(i).copied().unwrap_or(0);
            format!("{:width$}", cell.as_ref(), width = width)
        })
        .collect();
    padded.join("  ").trim_end().to_string()
}

/// Header, dashed rule, then one line per row.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths = column_widths(headers, rows);
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(render_line(headers, &widths));
    lines.push(rule.join("  "));
    lines.extend(rows.iter().map(|row| render_line(row.as_slice(), &widths)));
    lines.join("\n")
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    println!("{}", render_table(headers, &rows));
}
