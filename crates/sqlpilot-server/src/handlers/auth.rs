use axum::{
    extract::{Query, State},
    Extension, Json,
};
use sqlpilot_shared::api::{
    LoginRequest, RegisterRequest, TokenResponse, UsernameCheckQuery, UsernameCheckResponse,
};
use sqlpilot_shared::User;

use crate::auth::{create_access_token, AuthUser};
use crate::error::AppError;
use crate::routes::AppState;

/// POST /api/v1/users/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<User>, AppError> {
    let user = state.engine.register(&req.username, &req.password).await?;
    Ok(Json(user))
}

/// POST /api/v1/users/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let user = state.engine.authenticate(&req.username, &req.password).await?;

    let access_token = create_access_token(
        user.id,
        &state.config.jwt_secret,
        state.config.jwt_expires_in,
    )?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

/// GET /api/v1/users/me
pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<User>, AppError> {
    let user = state.engine.get_user(user.id).await?;
    Ok(Json(user))
}

/// GET /api/v1/users/check-username
pub async fn check_username(
    State(state): State<AppState>,
    Query(query): Query<UsernameCheckQuery>,
) -> Result<Json<UsernameCheckResponse>, AppError> {
    let exists = state.engine.username_exists(&query.username).await?;
    Ok(Json(UsernameCheckResponse { exists }))
}
