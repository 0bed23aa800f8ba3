use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameTableRequest {
    pub table_name: String,
}

/// Header plus the first few data rows of an uploaded table.
#[derive(Debug, Serialize, Deserialize)]
pub struct TablePreview {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateSqlRequest {
    pub table_id: Uuid,
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateSqlResponse {
    pub sql: String,
}
