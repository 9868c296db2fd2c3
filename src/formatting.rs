//! formatting prints out result tables nicely.

use crate::db::ExecResult;

/// Renders one result to stdout: a header line, then one line per row.
/// NULL cells print as empty.
/// In the future, also csv output, etc.
pub fn print_result(result: &ExecResult) {
    if result.header.is_empty() {
        println!("ok ({:?})", result.duration);
        return;
    }
    println!("{}", render(result));
}

fn render(result: &ExecResult) -> String {
    let mut widths: Vec<usize> = result.header.iter().map(|h| h.len()).collect();
    for row in &result.rows {
        for (i, cell) in row.iter().enumerate() {
            let len = cell.as_deref().unwrap_or("").len();
            if i < widths.len() && len > widths[i] {
                widths[i] = len;
            }
        }
    }
    let mut out = String::new();
    out.push_str(&format!(
        "| {} |\n",
        result
            .header
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
            .collect::<Vec<String>>()
            .join(" | ")
    ));
    for row in &result.rows {
        out.push_str(&format!(
            "| {} |\n",
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let width = widths.get(i).copied().unwrap_or(0);
                    format!("{:width$}", cell.as_deref().unwrap_or(""), width = width)
                })
                .collect::<Vec<String>>()
                .join(" | ")
        ));
    }
    out.pop();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_type::SqlType;
    use std::time::Duration;

    #[test]
    fn test_render_pads_columns_and_blanks_nulls() {
        let result = ExecResult {
            header: vec![String::from("id"), String::from("name")],
            rows: vec![
                vec![Some(String::from("1")), Some(String::from("Smith"))],
                vec![Some(String::from("2")), None],
            ],
            column_types: vec![SqlType::Integer, SqlType::Text],
            text: String::from("select * from t;"),
            duration: Duration::from_millis(1),
            error: None,
        };
        assert_eq!(
            render(&result),
            "| id | name  |\n| 1  | Smith |\n| 2  |       |"
        );
    }
}
