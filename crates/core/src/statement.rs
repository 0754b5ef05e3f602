//! Line-oriented statement splitting for SQL editor buffers.
//!
//! A statement ends on a line whose last non-blank character is `;`. Quotes
//! and comments are not inspected, so a `;` at the end of a line inside a
//! string literal also ends the statement.

fn ends_statement(line: &str) -> bool {
    line.trim_end().ends_with(';')
}

/// Statement that the zero-based `line` belongs to: from just after the
/// nearest earlier terminated line through the end of `line`, trimmed, with
/// its own `;` kept. Returns an empty string when `line` is past the end.
#[must_use]
pub fn statement_at(text: &str, line: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if line >= lines.len() {
        return String::new();
    }

    let start = lines[..line]
        .iter()
        .rposition(|candidate| ends_statement(candidate))
        .map_or(0, |terminated| terminated + 1);

    lines[start..=line].join("\n").trim().to_string()
}

/// Every statement in `text`, in order, using the same line rule as
/// [`statement_at`]. A trailing unterminated statement is included.
#[must_use]
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        current.push(line);
        if ends_statement(line) {
            push_trimmed(&mut statements, &current);
            current.clear();
        }
    }
    push_trimmed(&mut statements, &current);
    statements
}

fn push_trimmed(statements: &mut Vec<String>, lines: &[&str]) {
    let statement = lines.join("\n");
    let statement = statement.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{split_statements, statement_at};

    #[test]
    fn picks_statement_under_line() {
        let text = "SELECT 1;\nSELECT 2;\nSELECT 3;";
        assert_eq!(statement_at(text, 0), "SELECT 1;");
        assert_eq!(statement_at(text, 1), "SELECT 2;");
        assert_eq!(statement_at(text, 2), "SELECT 3;");
    }

    #[test]
    fn multi_line_statement_runs_to_target_line() {
        let text = "USE shop;\n\nSELECT id,\n       status\nFROM orders\nWHERE id = 3;\n";
        assert_eq!(statement_at(text, 3), "SELECT id,\n       status");
        assert_eq!(
            statement_at(text, 5),
            "SELECT id,\n       status\nFROM orders\nWHERE id = 3;"
        );
    }

    #[test]
    fn trailing_whitespace_after_terminator_still_terminates() {
        let text = "SELECT 1;   \nSELECT 2";
        assert_eq!(statement_at(text, 1), "SELECT 2");
    }

    #[test]
    fn out_of_range_line_is_empty() {
        assert_eq!(statement_at("SELECT 1;", 4), "");
        assert_eq!(statement_at("", 0), "");
    }

    #[test]
    fn splits_all_statements_in_order() {
        let text = "SELECT 1;\n\nUPDATE t\nSET a = 1;\n  \nSELECT 3";
        assert_eq!(
            split_statements(text),
            vec![
                "SELECT 1;".to_string(),
                "UPDATE t\nSET a = 1;".to_string(),
                "SELECT 3".to_string()
            ]
        );
        assert!(split_statements("  \n\n").is_empty());
    }
}
