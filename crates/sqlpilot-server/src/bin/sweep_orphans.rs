//! Reconciliation sweep between the database and the uploads directory.
//!
//! The identity engine trades transactional coupling for best-effort cleanup,
//! so crashes and failed deletes can leave files behind. This binary restores
//! the invariants offline:
//! 1. users whose avatar file is missing get a regenerated default;
//! 2. table rows whose data file is missing are deleted;
//! 3. avatar and table files referenced by no row are removed.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use sqlpilot_server::avatar::{self, AvatarStore, FsAvatarStore};
use sqlpilot_server::config::Config;
use sqlpilot_server::db::{self, DbPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sweep_orphans=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Starting synchronization between database and filesystem");

    let referenced_avatars = sweep_avatars(&pool, &config).await?;
    let referenced_table_files = sweep_table_rows(&pool).await?;

    remove_orphan_avatars(&config, &referenced_avatars).await?;
    remove_orphan_table_files(&config, &referenced_table_files).await?;

    tracing::info!("Synchronization finished at {}", Utc::now());
    Ok(())
}

/// Resets users whose avatar file vanished to a freshly generated default.
/// Returns the set of avatar file names still referenced afterwards.
async fn sweep_avatars(pool: &DbPool, config: &Config) -> anyhow::Result<HashSet<String>> {
    let store = FsAvatarStore::new(config.avatars_dir.clone(), avatar::AVATAR_PUBLIC_PREFIX);
    let users: Vec<(Uuid, String, String)> =
        sqlx::query_as("SELECT id, username, avatar_url FROM users")
            .fetch_all(pool)
            .await?;

    let mut referenced = HashSet::new();
    for (id, username, avatar_url) in users {
        if store.exists(&avatar_url).await {
            if let Some(name) = file_name(&avatar_url) {
                referenced.insert(name);
            }
            continue;
        }

        tracing::warn!(
            "Missing avatar file for user '{}': {}. Resetting to default.",
            username,
            avatar_url
        );

        let rendered = avatar::generate(&username)?;
        let new_url = store.write(&rendered.bytes, rendered.ext).await?;

        sqlx::query(
            "UPDATE users SET avatar_url = $2, is_default_avatar = TRUE, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&new_url)
        .execute(pool)
        .await?;

        if let Some(name) = file_name(&new_url) {
            referenced.insert(name);
        }
    }

    Ok(referenced)
}

/// Deletes table rows whose backing file is gone. Returns the set of file
/// paths still referenced afterwards.
async fn sweep_table_rows(pool: &DbPool) -> anyhow::Result<HashSet<String>> {
    let rows: Vec<(Uuid, String, String)> =
        sqlx::query_as("SELECT id, table_name, file_path FROM tables")
            .fetch_all(pool)
            .await?;

    let mut referenced = HashSet::new();
    for (id, table_name, file_path) in rows {
        if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
            referenced.insert(file_path);
            continue;
        }

        tracing::warn!(
            "Missing file for table '{}': {}. Deleting record.",
            table_name,
            file_path
        );
        sqlx::query("DELETE FROM tables WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
    }

    Ok(referenced)
}

async fn remove_orphan_avatars(
    config: &Config,
    referenced: &HashSet<String>,
) -> anyhow::Result<()> {
    let Ok(mut entries) = tokio::fs::read_dir(&config.avatars_dir).await else {
        return Ok(());
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if referenced.contains(&name) {
            continue;
        }
        tracing::info!("Removing orphan avatar file {}", name);
        if let Err(e) = tokio::fs::remove_file(entry.path()).await {
            tracing::warn!("Failed to remove {}: {}", entry.path().display(), e);
        }
    }

    Ok(())
}

async fn remove_orphan_table_files(
    config: &Config,
    referenced: &HashSet<String>,
) -> anyhow::Result<()> {
    let tables_dir = format!("{}/tables", config.uploads_dir);
    let Ok(mut user_dirs) = tokio::fs::read_dir(&tables_dir).await else {
        return Ok(());
    };

    while let Some(user_dir) = user_dirs.next_entry().await? {
        if !user_dir.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(user_dir.path()).await?;
        while let Some(entry) = files.next_entry().await? {
            let path = format!(
                "{}/{}/{}",
                tables_dir,
                user_dir.file_name().to_string_lossy(),
                entry.file_name().to_string_lossy()
            );
            if referenced.contains(&path) {
                continue;
            }
            tracing::info!("Removing orphan table file {}", path);
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!("Failed to remove {}: {}", path, e);
            }
        }
    }

    Ok(())
}

fn file_name(locator: &str) -> Option<String> {
    Path::new(locator)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}
