//! Plain-text table rendering for `ps`.

/// Render rows under a header, each column padded to its widest cell.
pub fn render(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len() + 4).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len() + 1);
            }
        }
    }

    let mut out = String::new();
    for (i, title) in header.iter().enumerate() {
        out.push_str(&format!("{:<width$} ", title, width = widths[i]));
    }
    out.push('\n');
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(&format!("{:<width$} ", cell, width = widths[i]));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_align() {
        let header = ["GROUP", "STATE"];
        let rows = vec![
            vec!["abcdef0123456789".to_string(), "passing".to_string()],
            vec!["x".to_string(), "critical".to_string()],
        ];
        let output = render(&header, &rows);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        let state_col = lines[0].find("STATE").unwrap();
        assert_eq!(lines[1].find("passing").unwrap(), state_col);
        assert_eq!(lines[2].find("critical").unwrap(), state_col);
    }
}
