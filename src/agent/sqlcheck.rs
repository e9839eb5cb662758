// SQL extraction and the safety policy for generated statements
//
// Every statement that reaches execution has passed through here:
// - extraction pulls the SQL out of fenced or free-form model output;
// - the safety check enforces SELECT-only, no mutating keywords, and the
//   presence of the soft-delete filter;
// - the syntax check parses the statement with the PostgreSQL dialect.

use regex::Regex;
use serde_json::{Map, Value};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::OnceLock;

use super::state::FormattedResults;

/// Keywords whose presence anywhere in the statement fails validation
const DANGEROUS_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE", "DECLARE", "CURSOR",
];

/// Pull a SQL statement out of a model response.
///
/// Tries, in order: a ```sql fence, any fence, a trailing `SELECT ...;`
/// match, and finally the trimmed response itself.
pub fn extract_sql(response: &str) -> String {
    static SQL_FENCE: OnceLock<Regex> = OnceLock::new();
    static ANY_FENCE: OnceLock<Regex> = OnceLock::new();
    static SELECT_STMT: OnceLock<Regex> = OnceLock::new();

    let sql_fence =
        SQL_FENCE.get_or_init(|| Regex::new(r"(?s)```sql\n(.*?)\n```").unwrap());
    if let Some(caps) = sql_fence.captures(response) {
        return caps[1].trim().to_string();
    }

    let any_fence = ANY_FENCE.get_or_init(|| Regex::new(r"(?s)```\n(.*?)\n```").unwrap());
    if let Some(caps) = any_fence.captures(response) {
        return caps[1].trim().to_string();
    }

    let select_stmt =
        SELECT_STMT.get_or_init(|| Regex::new(r"(?si)(SELECT.*?;)").unwrap());
    if let Some(caps) = select_stmt.captures(response) {
        return caps[1].trim().to_string();
    }

    response.trim().to_string()
}

/// Enforce the safety policy. Returns the reason on rejection.
pub fn validate_safety(sql: &str) -> Result<(), String> {
    static DANGEROUS: OnceLock<Regex> = OnceLock::new();
    let dangerous = DANGEROUS.get_or_init(|| {
        Regex::new(&format!(r"\b({})\b", DANGEROUS_KEYWORDS.join("|"))).unwrap()
    });

    let upper = sql.trim().to_uppercase();

    if !upper.starts_with("SELECT") {
        return Err("Only SELECT queries are allowed".to_string());
    }

    if let Some(found) = dangerous.find(&upper) {
        return Err(format!("Dangerous keyword detected: {}", found.as_str()));
    }

    if !upper.contains("DELETED") {
        return Err("Must include 'deleted = FALSE' condition".to_string());
    }

    Ok(())
}

/// Parse the statement and require exactly a query.
pub fn validate_syntax(sql: &str) -> Result<(), String> {
    if sql.trim().is_empty() {
        return Err("Empty or invalid SQL".to_string());
    }

    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| format!("Syntax error: {e}"))?;

    match statements.as_slice() {
        [] => Err("Empty or invalid SQL".to_string()),
        [Statement::Query(_)] => Ok(()),
        [_] => Err("Only SELECT statements allowed".to_string()),
        _ => Err("Multiple statements are not allowed".to_string()),
    }
}

/// Shape raw rows into the terminal payload, capped at `limit`
pub fn format_results(results: &[Map<String, Value>], limit: usize) -> FormattedResults {
    let displayed = results.len().min(limit);
    FormattedResults {
        count: results.len(),
        displayed,
        data: results[..displayed]
            .iter()
            .map(|row| Value::Object(row.clone()))
            .collect(),
        truncated: results.len() > limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_from_sql_fence() {
        let response = "Here you go:\n```sql\nSELECT 1\nFROM logs\n```\nDone.";
        assert_eq!(extract_sql(response), "SELECT 1\nFROM logs");
    }

    #[test]
    fn extracts_from_plain_fence() {
        let response = "```\nSELECT 2 FROM logs\n```";
        assert_eq!(extract_sql(response), "SELECT 2 FROM logs");
    }

    #[test]
    fn extracts_trailing_select() {
        let response = "The query is SELECT id FROM logs WHERE deleted = FALSE;";
        assert_eq!(
            extract_sql(response),
            "SELECT id FROM logs WHERE deleted = FALSE;"
        );
    }

    #[test]
    fn falls_back_to_trimmed_response() {
        assert_eq!(extract_sql("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn safety_requires_select_prefix() {
        let err = validate_safety("WITH x AS (SELECT 1) SELECT * FROM x").unwrap_err();
        assert_eq!(err, "Only SELECT queries are allowed");

        let err = validate_safety("DELETE FROM logs WHERE deleted = FALSE").unwrap_err();
        assert_eq!(err, "Only SELECT queries are allowed");
    }

    #[test]
    fn safety_rejects_every_dangerous_keyword() {
        for keyword in DANGEROUS_KEYWORDS {
            let sql = format!("SELECT * FROM logs WHERE deleted = FALSE; {keyword} x");
            let err = validate_safety(&sql).unwrap_err();
            assert!(
                err.contains(keyword),
                "expected {keyword} rejection, got: {err}"
            );
        }
    }

    #[test]
    fn safety_keyword_check_is_word_bounded() {
        // "created_at" contains CREATE but must not trip the check
        let sql = "SELECT created_at, updated_count FROM logs WHERE deleted = FALSE";
        assert!(validate_safety(sql).is_ok());
    }

    #[test]
    fn safety_requires_deleted_token() {
        let err = validate_safety("SELECT * FROM logs").unwrap_err();
        assert!(err.contains("deleted = FALSE"));
    }

    #[test]
    fn syntax_accepts_valid_select() {
        assert!(validate_syntax(
            "SELECT service, COUNT(*) FROM logs WHERE deleted = FALSE GROUP BY service"
        )
        .is_ok());
    }

    #[test]
    fn syntax_rejects_empty_and_broken() {
        assert!(validate_syntax("").is_err());
        assert!(validate_syntax("   ").is_err());
        assert!(validate_syntax("SELEC * FORM logs").is_err());
    }

    #[test]
    fn syntax_rejects_non_query_statements() {
        let err = validate_syntax("UPDATE logs SET deleted = TRUE").unwrap_err();
        assert_eq!(err, "Only SELECT statements allowed");
    }

    #[test]
    fn formatting_caps_and_flags_truncation() {
        let rows: Vec<Map<String, Value>> = (0..5)
            .map(|i| {
                let mut row = Map::new();
                row.insert("n".to_string(), json!(i));
                row
            })
            .collect();

        let formatted = format_results(&rows, 3);
        assert_eq!(formatted.count, 5);
        assert_eq!(formatted.displayed, 3);
        assert_eq!(formatted.data.len(), 3);
        assert!(formatted.truncated);

        let all = format_results(&rows, 10);
        assert_eq!(all.displayed, 5);
        assert!(!all.truncated);
    }

    #[test]
    fn formatting_empty_results() {
        let formatted = format_results(&[], 100);
        assert_eq!(formatted.count, 0);
        assert!(!formatted.truncated);
    }
}
