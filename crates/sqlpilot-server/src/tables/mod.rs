use sqlpilot_shared::api::TablePreview;

use crate::error::AppError;

mod preview;

pub use preview::preview_csv;

/// Rows shown by the preview endpoint.
pub const PREVIEW_ROWS: usize = 5;

/// Trims and validates a user-facing table name: 3-50 characters,
/// alphanumeric plus underscore.
pub fn validate_table_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.len() < 3 || name.len() > 50 {
        return Err(AppError::Validation(
            "Table name must be between 3 and 50 characters.".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::Validation(
            "Table name can only contain alphanumeric characters and underscores.".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Placeholder for the natural-language-to-SQL translator. Until a real
/// model is wired in, it answers with a browsable default query.
pub fn generate_sql_stub(question: &str, table_name: &str) -> String {
    format!(
        "-- question: {}\nSELECT * FROM {} LIMIT 10;",
        question.trim(),
        table_name
    )
}

pub fn preview_of(bytes: &[u8]) -> Result<TablePreview, AppError> {
    preview_csv(bytes, PREVIEW_ROWS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_trimmed_and_validated() {
        assert_eq!(validate_table_name("  sales_2024  ").unwrap(), "sales_2024");
        assert!(validate_table_name("ab").is_err());
        assert!(validate_table_name("bad-name").is_err());
        assert!(validate_table_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn sql_stub_references_question_and_table() {
        let sql = generate_sql_stub(" total revenue? ", "sales");
        assert!(sql.contains("total revenue?"));
        assert!(sql.contains("FROM sales"));
    }
}
