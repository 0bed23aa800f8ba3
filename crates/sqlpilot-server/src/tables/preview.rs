use sqlpilot_shared::api::TablePreview;

use crate::error::AppError;

/// Reads the header and the first `max_rows` data rows of a CSV document.
/// Ragged rows are tolerated; a file without data rows is an error, matching
/// the upload validation.
pub fn preview_csv(bytes: &[u8], max_rows: usize) -> Result<TablePreview, AppError> {
    if bytes.is_empty() {
        return Err(AppError::Validation(
            "The uploaded file is empty.".to_string(),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::Validation(format!("Could not parse file: {}", e)))?
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut rows = Vec::with_capacity(max_rows);
    for record in reader.records().take(max_rows) {
        let record =
            record.map_err(|e| AppError::Validation(format!("Could not parse file: {}", e)))?;
        rows.push(record.iter().map(|s| s.to_string()).collect());
    }

    if rows.is_empty() {
        return Err(AppError::Validation(
            "The file contains no data.".to_string(),
        ));
    }

    Ok(TablePreview { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previews_header_and_first_rows() {
        let csv = b"name,age\nalice,30\nbob,25\ncarol,41\n";
        let preview = preview_csv(csv, 2).unwrap();

        assert_eq!(preview.header, vec!["name", "age"]);
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.rows[0], vec!["alice", "30"]);
    }

    #[test]
    fn short_files_yield_all_rows() {
        let csv = b"name\nalice\n";
        let preview = preview_csv(csv, 5).unwrap();
        assert_eq!(preview.rows, vec![vec!["alice"]]);
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(matches!(
            preview_csv(b"", 5),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn header_only_file_is_rejected() {
        assert!(matches!(
            preview_csv(b"name,age\n", 5),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn ragged_rows_are_tolerated() {
        let csv = b"a,b,c\n1,2\n3,4,5,6\n";
        let preview = preview_csv(csv, 5).unwrap();
        assert_eq!(preview.rows.len(), 2);
    }
}
