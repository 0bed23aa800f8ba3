use std::path::Path;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Extension, Json,
};
use sqlpilot_shared::api::{ChangePasswordRequest, UpdateUsernameRequest};
use sqlpilot_shared::User;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::routes::AppState;

/// PUT /api/v1/users/me/username
pub async fn update_username(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<UpdateUsernameRequest>,
) -> Result<Json<User>, AppError> {
    let updated = state.engine.change_username(user.id, &req.username).await?;
    Ok(Json(updated))
}

/// PUT /api/v1/users/me/avatar (multipart, field `file`)
pub async fn upload_avatar(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<Json<User>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart payload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let ext = field
            .file_name()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_string())
            .ok_or(AppError::UnsupportedImageFormat)?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Invalid multipart payload: {}", e)))?;

        let updated = state.engine.upload_avatar(user.id, &bytes, &ext).await?;
        return Ok(Json(updated));
    }

    Err(AppError::Validation(
        "Multipart field 'file' is required".to_string(),
    ))
}

/// DELETE /api/v1/users/me/avatar
pub async fn delete_avatar(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<User>, AppError> {
    let updated = state.engine.delete_avatar(user.id).await?;
    Ok(Json(updated))
}

/// PUT /api/v1/users/me/password
pub async fn update_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AppError> {
    state
        .engine
        .change_password(user.id, &req.old_password, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
