use std::path::Path;

use axum::{
    extract::{Multipart, Path as UrlPath, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sqlpilot_shared::api::{
    GenerateSqlRequest, GenerateSqlResponse, RenameTableRequest, TablePreview,
};
use sqlpilot_shared::TableMeta;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::routes::AppState;
use crate::tables;

async fn table_name_taken(
    state: &AppState,
    user_id: Uuid,
    table_name: &str,
) -> Result<bool, AppError> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM tables WHERE user_id = $1 AND table_name = $2")
            .bind(user_id)
            .bind(table_name)
            .fetch_optional(&state.db)
            .await?;
    Ok(existing.is_some())
}

/// POST /api/v1/tables/upload (multipart: `file`, optional `table_name`)
pub async fn upload_table(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<Json<TableMeta>, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut custom_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart payload: {}", e)))?
    {
        let field_name = field.name().map(|s| s.to_string());
        match field_name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(|name| name.to_string())
                    .ok_or_else(|| {
                        AppError::Validation("Uploaded file must have a name".to_string())
                    })?;
                let bytes = field.bytes().await.map_err(|e| {
                    AppError::Validation(format!("Invalid multipart payload: {}", e))
                })?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("table_name") => {
                let value = field.text().await.map_err(|e| {
                    AppError::Validation(format!("Invalid multipart payload: {}", e))
                })?;
                if !value.trim().is_empty() {
                    custom_name = Some(value);
                }
            }
            _ => {}
        }
    }

    let (original_file_name, content) = file.ok_or_else(|| {
        AppError::Validation("Multipart field 'file' is required".to_string())
    })?;

    if !original_file_name.to_ascii_lowercase().ends_with(".csv") {
        return Err(AppError::Validation(
            "Unsupported file type. Please upload a .csv file.".to_string(),
        ));
    }
    if content.is_empty() {
        return Err(AppError::Validation(
            "The uploaded file is empty.".to_string(),
        ));
    }

    let base_name = match custom_name {
        Some(name) => name,
        None => Path::new(&original_file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&original_file_name)
            .to_string(),
    };
    let table_name = tables::validate_table_name(&base_name)?;

    if table_name_taken(&state, user.id, &table_name).await? {
        return Err(AppError::Conflict(format!(
            "Table '{}' already exists.",
            table_name
        )));
    }

    let user_dir = format!("{}/tables/{}", state.config.uploads_dir, user.id);
    tokio::fs::create_dir_all(&user_dir)
        .await
        .map_err(|e| AppError::Storage(format!("create {}: {}", user_dir, e)))?;

    let file_path = format!("{}/{}.csv", user_dir, Uuid::new_v4());
    tokio::fs::write(&file_path, &content)
        .await
        .map_err(|e| AppError::Storage(format!("write {}: {}", file_path, e)))?;

    let inserted: Result<TableMeta, sqlx::Error> = sqlx::query_as(
        r#"
        INSERT INTO tables (id, user_id, table_name, original_file_name, file_path)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, user_id, table_name, original_file_name, description, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(&table_name)
    .bind(&original_file_name)
    .bind(&file_path)
    .fetch_one(&state.db)
    .await;

    let meta = match inserted {
        Ok(meta) => meta,
        Err(e) => {
            // The row never existed, so the just-written file is an orphan.
            if let Err(io_err) = tokio::fs::remove_file(&file_path).await {
                tracing::warn!("Failed to remove {} after insert error: {}", file_path, io_err);
            }
            return Err(e.into());
        }
    };

    Ok(Json(meta))
}

/// GET /api/v1/tables/
pub async fn list_tables(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<TableMeta>>, AppError> {
    let rows: Vec<TableMeta> = sqlx::query_as(
        r#"
        SELECT id, user_id, table_name, original_file_name, description, created_at
        FROM tables
        WHERE user_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(user.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(rows))
}

/// PUT /api/v1/tables/:id
pub async fn rename_table(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    UrlPath(table_id): UrlPath<Uuid>,
    Json(req): Json<RenameTableRequest>,
) -> Result<Json<TableMeta>, AppError> {
    let table_name = tables::validate_table_name(&req.table_name)?;

    if table_name_taken(&state, user.id, &table_name).await? {
        return Err(AppError::Conflict(format!(
            "Table '{}' already exists.",
            table_name
        )));
    }

    let row: Option<TableMeta> = sqlx::query_as(
        r#"
        UPDATE tables SET table_name = $3
        WHERE id = $1 AND user_id = $2
        RETURNING id, user_id, table_name, original_file_name, description, created_at
        "#,
    )
    .bind(table_id)
    .bind(user.id)
    .bind(&table_name)
    .fetch_optional(&state.db)
    .await?;

    row.map(Json).ok_or(AppError::NotFound)
}

/// DELETE /api/v1/tables/:id
pub async fn delete_table(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    UrlPath(table_id): UrlPath<Uuid>,
) -> Result<Json<TableMeta>, AppError> {
    let row: Option<(Uuid, Uuid, String, String, Option<String>, DateTime<Utc>, String)> =
        sqlx::query_as(
            r#"
            DELETE FROM tables
            WHERE id = $1 AND user_id = $2
            RETURNING id, user_id, table_name, original_file_name, description, created_at, file_path
            "#,
        )
        .bind(table_id)
        .bind(user.id)
        .fetch_optional(&state.db)
        .await?;

    let (id, user_id, table_name, original_file_name, description, created_at, file_path) =
        row.ok_or(AppError::NotFound)?;

    // Row is gone; removing the file is best-effort cleanup.
    if let Err(e) = tokio::fs::remove_file(&file_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove table file {}: {}", file_path, e);
        }
    }

    Ok(Json(TableMeta {
        id,
        user_id,
        table_name,
        original_file_name,
        description,
        created_at,
    }))
}

/// GET /api/v1/tables/:id/preview
pub async fn preview_table(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    UrlPath(table_id): UrlPath<Uuid>,
) -> Result<Json<TablePreview>, AppError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT file_path FROM tables WHERE id = $1 AND user_id = $2")
            .bind(table_id)
            .bind(user.id)
            .fetch_optional(&state.db)
            .await?;

    let (file_path,) = row.ok_or(AppError::NotFound)?;

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|e| AppError::Storage(format!("read {}: {}", file_path, e)))?;

    Ok(Json(tables::preview_of(&bytes)?))
}

/// POST /api/v1/tables/generate-sql
pub async fn generate_sql(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<GenerateSqlRequest>,
) -> Result<Json<GenerateSqlResponse>, AppError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT table_name FROM tables WHERE id = $1 AND user_id = $2")
            .bind(req.table_id)
            .bind(user.id)
            .fetch_optional(&state.db)
            .await?;

    let (table_name,) = row.ok_or(AppError::NotFound)?;

    Ok(Json(GenerateSqlResponse {
        sql: tables::generate_sql_stub(&req.question, &table_name),
    }))
}
