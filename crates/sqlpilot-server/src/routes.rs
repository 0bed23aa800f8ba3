use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, services::ServeDir, trace::TraceLayer,
};

use crate::auth::auth_middleware;
use crate::avatar::{FsAvatarStore, AVATAR_PUBLIC_PREFIX};
use crate::config::Config;
use crate::db::DbPool;
use crate::handlers::{auth as auth_handlers, tables as table_handlers, users as user_handlers};
use crate::identity::{IdentityEngine, PgUserStore};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub engine: Arc<IdentityEngine>,
}

pub fn create_router(db: DbPool, config: Config) -> Router {
    let engine = Arc::new(IdentityEngine::new(
        Arc::new(PgUserStore::new(db.clone())),
        Arc::new(FsAvatarStore::new(
            config.avatars_dir.clone(),
            AVATAR_PUBLIC_PREFIX,
        )),
        config.password_policy.clone(),
    ));

    let state = AppState {
        db,
        config: config.clone(),
        engine,
    };

    // Public user routes (no middleware)
    let public_user_routes = Router::new()
        .route("/register", post(auth_handlers::register))
        .route("/login", post(auth_handlers::login))
        .route("/check-username", get(auth_handlers::check_username));

    // Protected user routes (need auth)
    let protected_user_routes = Router::new()
        .route("/me", get(auth_handlers::me))
        .route("/me/username", put(user_handlers::update_username))
        .route("/me/avatar", put(user_handlers::upload_avatar))
        .route("/me/avatar", delete(user_handlers::delete_avatar))
        .route("/me/password", put(user_handlers::update_password))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let user_routes = Router::new()
        .merge(public_user_routes)
        .merge(protected_user_routes);

    // Table routes (all protected)
    let table_routes = Router::new()
        .route("/", get(table_handlers::list_tables))
        .route("/upload", post(table_handlers::upload_table))
        .route("/:id", put(table_handlers::rename_table))
        .route("/:id", delete(table_handlers::delete_table))
        .route("/:id/preview", get(table_handlers::preview_table))
        .route("/generate-sql", post(table_handlers::generate_sql))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1/users", user_routes)
        .nest("/api/v1/tables", table_routes)
        .nest_service("/uploads", ServeDir::new(&config.uploads_dir))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
