use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use sqlpilot_shared::User;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password};
use crate::avatar::{self, AvatarStore};
use crate::config::PasswordPolicy;
use crate::error::AppError;

use super::store::{NewUser, UserPatch, UserRecord, UserStore};

const SUPPORTED_IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg"];

fn username_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{3,20}$").expect("valid username regex"))
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if !username_re().is_match(username) {
        return Err(AppError::Validation(
            "Invalid username format. Use 3-20 alphanumeric characters or underscores.".to_string(),
        ));
    }
    Ok(())
}

fn validate_new_password(policy: &PasswordPolicy, password: &str) -> Result<(), AppError> {
    if policy.alphanumeric_only && !password.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(
            "Password can only contain alphanumeric characters.".to_string(),
        ));
    }
    if password.len() < policy.min_length || password.len() > policy.max_length {
        return Err(AppError::Validation(format!(
            "Password must be between {} and {} characters.",
            policy.min_length, policy.max_length
        )));
    }
    if policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "Password must contain at least one number.".to_string(),
        ));
    }
    Ok(())
}

/// Orchestrates every mutation of a user's display identity so the user row
/// and the avatar file on disk stay consistent, and already-issued tokens
/// (keyed by id only) stay valid.
///
/// There is no transaction spanning the database and the filesystem. The
/// engine therefore always writes the replacement avatar before touching the
/// row, and removes the superseded file only afterwards, best-effort: a crash
/// or failed delete leaves an orphan file for the sweep binary, never a user
/// whose `avatar_url` points at nothing.
pub struct IdentityEngine {
    store: Arc<dyn UserStore>,
    avatars: Arc<dyn AvatarStore>,
    policy: PasswordPolicy,
    // One async mutex per user id seen by this process; identity mutations
    // for the same user are serialized, different users proceed in parallel.
    user_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl IdentityEngine {
    pub fn new(
        store: Arc<dyn UserStore>,
        avatars: Arc<dyn AvatarStore>,
        policy: PasswordPolicy,
    ) -> Self {
        Self {
            store,
            avatars,
            policy,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_user(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.user_locks.lock().expect("user lock map poisoned");
            // An entry only the map still holds has no outstanding guard,
            // so it can be dropped instead of accumulating forever.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn lock_map_len(&self) -> usize {
        self.user_locks.lock().expect("user lock map poisoned").len()
    }

    /// Creates a user with a freshly generated default avatar. Writes exactly
    /// one avatar file; if the insert loses a race on the username's unique
    /// constraint, that file is removed again best-effort.
    pub async fn register(&self, username: &str, password: &str) -> Result<User, AppError> {
        validate_username(username)?;
        if password.len() < self.policy.min_length {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters.",
                self.policy.min_length
            )));
        }

        if self.store.get_by_username(username).await?.is_some() {
            return Err(AppError::Conflict(
                "The user with this username already exists in the system.".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;
        let rendered = avatar::generate(username)?;
        let avatar_url = self.avatars.write(&rendered.bytes, rendered.ext).await?;

        match self
            .store
            .create(NewUser {
                username: username.to_string(),
                password_hash,
                avatar_url: avatar_url.clone(),
                is_default_avatar: true,
            })
            .await
        {
            Ok(record) => Ok(record.public()),
            Err(e) => {
                // Lost the uniqueness race after the file was written.
                self.avatars.delete(&avatar_url).await.log(&avatar_url);
                Err(e)
            }
        }
    }

    /// Renames a user. With a default avatar the image is regenerated from
    /// the new name (new file written before the old one is removed); a
    /// custom avatar is never touched. Renaming to the current name is a
    /// no-op, not an error.
    pub async fn change_username(&self, user_id: Uuid, new_username: &str) -> Result<User, AppError> {
        let _guard = self.lock_user(user_id).await;

        let user = self.store.get(user_id).await?.ok_or(AppError::NotFound)?;

        if new_username == user.username {
            return Ok(user.public());
        }

        validate_username(new_username)?;

        if let Some(other) = self.store.get_by_username(new_username).await? {
            if other.id != user_id {
                return Err(AppError::Conflict("Username already exists".to_string()));
            }
        }

        if !user.is_default_avatar {
            let updated = self
                .store
                .update(
                    user_id,
                    UserPatch {
                        username: Some(new_username.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(updated.public());
        }

        // Default avatar: regenerate from the new name. Write the new file
        // first so there is never a moment with zero live avatar files.
        let rendered = avatar::generate(new_username)?;
        let new_avatar_url = self.avatars.write(&rendered.bytes, rendered.ext).await?;

        let updated = match self
            .store
            .update(
                user_id,
                UserPatch {
                    username: Some(new_username.to_string()),
                    avatar_url: Some(new_avatar_url.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.avatars
                    .delete(&new_avatar_url)
                    .await
                    .log(&new_avatar_url);
                return Err(e);
            }
        };

        // The row now references the new file; removing the old one is
        // best-effort cleanup and must not fail the rename.
        self.avatars.delete(&user.avatar_url).await.log(&user.avatar_url);

        Ok(updated.public())
    }

    /// Replaces the current avatar (default or custom) with uploaded bytes.
    pub async fn upload_avatar(
        &self,
        user_id: Uuid,
        image_bytes: &[u8],
        declared_ext: &str,
    ) -> Result<User, AppError> {
        let ext = declared_ext.trim_start_matches('.').to_ascii_lowercase();
        if !SUPPORTED_IMAGE_EXTS.contains(&ext.as_str()) {
            return Err(AppError::UnsupportedImageFormat);
        }

        let _guard = self.lock_user(user_id).await;

        let user = self.store.get(user_id).await?.ok_or(AppError::NotFound)?;

        // The new name is collision-free, so write-first is safe here too
        // and keeps avatar_url pointing at an existing file throughout.
        let new_avatar_url = self.avatars.write(image_bytes, &ext).await?;

        let updated = match self
            .store
            .update(
                user_id,
                UserPatch {
                    avatar_url: Some(new_avatar_url.clone()),
                    is_default_avatar: Some(false),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.avatars
                    .delete(&new_avatar_url)
                    .await
                    .log(&new_avatar_url);
                return Err(e);
            }
        };

        self.avatars.delete(&user.avatar_url).await.log(&user.avatar_url);

        Ok(updated.public())
    }

    /// Reverts a custom avatar to a generated default for the current
    /// username. Already-default users are returned unchanged.
    pub async fn delete_avatar(&self, user_id: Uuid) -> Result<User, AppError> {
        let _guard = self.lock_user(user_id).await;

        let user = self.store.get(user_id).await?.ok_or(AppError::NotFound)?;

        if user.is_default_avatar {
            return Ok(user.public());
        }

        let rendered = avatar::generate(&user.username)?;
        let new_avatar_url = self.avatars.write(&rendered.bytes, rendered.ext).await?;

        let updated = match self
            .store
            .update(
                user_id,
                UserPatch {
                    avatar_url: Some(new_avatar_url.clone()),
                    is_default_avatar: Some(true),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.avatars
                    .delete(&new_avatar_url)
                    .await
                    .log(&new_avatar_url);
                return Err(e);
            }
        };

        self.avatars.delete(&user.avatar_url).await.log(&user.avatar_url);

        Ok(updated.public())
    }

    /// Verifies the old password and stores a new hash. No avatar or
    /// username side effects, and previously issued tokens stay valid.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let _guard = self.lock_user(user_id).await;

        let user = self.store.get(user_id).await?.ok_or(AppError::NotFound)?;

        if !verify_password(old_password, &user.password_hash)? {
            return Err(AppError::IncorrectOldPassword);
        }

        validate_new_password(&self.policy, new_password)?;

        let password_hash = hash_password(new_password)?;
        self.store
            .update(
                user_id,
                UserPatch {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?;

        Ok(())
    }

    /// Username/password check for login. A missing user and a wrong
    /// password are indistinguishable to the caller.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, AppError> {
        let user = self
            .store
            .get_by_username(username)
            .await?
            .ok_or(AppError::Unauthorized)?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized);
        }

        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, AppError> {
        let user = self.store.get(user_id).await?.ok_or(AppError::NotFound)?;
        Ok(user.public())
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool, AppError> {
        Ok(self.store.get_by_username(username).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::test_support::{
        FailingDeleteStore, FailingWriteStore, MemoryAvatarStore,
    };
    use crate::identity::test_support::MemoryUserStore;

    struct Fixture {
        engine: IdentityEngine,
        avatars: Arc<MemoryAvatarStore>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserStore::default());
        let avatars = Arc::new(MemoryAvatarStore::default());
        let engine = IdentityEngine::new(
            users,
            avatars.clone(),
            PasswordPolicy::default(),
        );
        Fixture { engine, avatars }
    }

    #[tokio::test]
    async fn register_creates_user_with_default_avatar() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();

        assert_eq!(user.username, "alice");
        assert!(user.is_default_avatar);
        assert!(fx.avatars.exists(&user.avatar_url).await);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn register_rejects_invalid_input() {
        let fx = fixture();

        let too_long = "a".repeat(21);
        for username in ["", "ab", "user-name", "has space", too_long.as_str()] {
            let err = fx.engine.register(username, "password123").await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{:?}", username);
        }

        let err = fx.engine.register("alice", "short1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // No avatar file may be written for a rejected registration.
        assert_eq!(fx.avatars.file_count(), 0);
    }

    #[tokio::test]
    async fn register_rejects_taken_username() {
        let fx = fixture();

        fx.engine.register("alice", "password123").await.unwrap();
        let err = fx.engine.register("alice", "password456").await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn change_username_to_same_name_is_a_noop() {
        let fx = fixture();

        let before = fx.engine.register("alice", "password123").await.unwrap();
        let after = fx
            .engine
            .change_username(before.id, "alice")
            .await
            .unwrap();

        assert_eq!(before, after);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn change_username_regenerates_default_avatar() {
        let fx = fixture();

        let before = fx.engine.register("alice", "password123").await.unwrap();
        let after = fx
            .engine
            .change_username(before.id, "alice2")
            .await
            .unwrap();

        assert_eq!(after.username, "alice2");
        assert!(after.is_default_avatar);
        assert_ne!(after.avatar_url, before.avatar_url);
        assert!(fx.avatars.exists(&after.avatar_url).await);
        assert!(!fx.avatars.exists(&before.avatar_url).await);
    }

    #[tokio::test]
    async fn change_username_preserves_custom_avatar() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();
        let custom = fx
            .engine
            .upload_avatar(user.id, b"custom image bytes", "png")
            .await
            .unwrap();

        let renamed = fx
            .engine
            .change_username(user.id, "alice2")
            .await
            .unwrap();

        assert_eq!(renamed.username, "alice2");
        assert_eq!(renamed.avatar_url, custom.avatar_url);
        assert_eq!(
            fx.avatars.bytes_of(&renamed.avatar_url).unwrap(),
            b"custom image bytes"
        );
    }

    #[tokio::test]
    async fn change_username_conflict_leaves_state_untouched() {
        let fx = fixture();

        let alice = fx.engine.register("alice", "password123").await.unwrap();
        fx.engine.register("bob", "password123").await.unwrap();

        let err = fx.engine.change_username(alice.id, "bob").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let unchanged = fx.engine.get_user(alice.id).await.unwrap();
        assert_eq!(unchanged.username, "alice");
        assert_eq!(unchanged.avatar_url, alice.avatar_url);
        assert!(fx.avatars.exists(&alice.avatar_url).await);
        assert_eq!(fx.avatars.file_count(), 2);
    }

    #[tokio::test]
    async fn change_username_of_missing_user_is_not_found() {
        let fx = fixture();
        let err = fx
            .engine
            .change_username(Uuid::new_v4(), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn upload_avatar_flips_to_custom() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();
        let updated = fx
            .engine
            .upload_avatar(user.id, b"png bytes", "PNG")
            .await
            .unwrap();

        assert!(!updated.is_default_avatar);
        assert_ne!(updated.avatar_url, user.avatar_url);
        assert!(fx.avatars.exists(&updated.avatar_url).await);
        // The generated default was superseded and cleaned up.
        assert!(!fx.avatars.exists(&user.avatar_url).await);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn upload_avatar_rejects_unsupported_format() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();
        let err = fx
            .engine
            .upload_avatar(user.id, b"gif bytes", "gif")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UnsupportedImageFormat));
        let unchanged = fx.engine.get_user(user.id).await.unwrap();
        assert_eq!(unchanged.avatar_url, user.avatar_url);
    }

    #[tokio::test]
    async fn delete_avatar_reverts_to_default_and_is_idempotent() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();
        let custom = fx
            .engine
            .upload_avatar(user.id, b"custom", "jpeg")
            .await
            .unwrap();

        let reverted = fx.engine.delete_avatar(user.id).await.unwrap();
        assert!(reverted.is_default_avatar);
        assert_ne!(reverted.avatar_url, custom.avatar_url);
        assert!(fx.avatars.exists(&reverted.avatar_url).await);
        assert!(!fx.avatars.exists(&custom.avatar_url).await);

        // A second delete changes nothing.
        let again = fx.engine.delete_avatar(user.id).await.unwrap();
        assert_eq!(again.avatar_url, reverted.avatar_url);
        assert!(again.is_default_avatar);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_fail_username_change() {
        let users = Arc::new(MemoryUserStore::default());
        let avatars = Arc::new(MemoryAvatarStore::default());
        let engine = IdentityEngine::new(
            users.clone(),
            Arc::new(FailingDeleteStore(avatars.clone())),
            PasswordPolicy::default(),
        );

        let before = engine.register("alice", "password123").await.unwrap();
        let after = engine.change_username(before.id, "alice2").await.unwrap();

        assert_eq!(after.username, "alice2");
        assert_ne!(after.avatar_url, before.avatar_url);
        // Old file is still there: an orphan for the sweep, not an error.
        assert!(avatars.exists(&before.avatar_url).await);
        assert!(avatars.exists(&after.avatar_url).await);
    }

    #[tokio::test]
    async fn failed_avatar_write_aborts_username_change() {
        let users = Arc::new(MemoryUserStore::default());
        let avatars = Arc::new(MemoryAvatarStore::default());

        let working = IdentityEngine::new(
            users.clone(),
            avatars.clone(),
            PasswordPolicy::default(),
        );
        let before = working.register("alice", "password123").await.unwrap();

        let broken = IdentityEngine::new(
            users.clone(),
            Arc::new(FailingWriteStore(avatars.clone())),
            PasswordPolicy::default(),
        );
        let err = broken.change_username(before.id, "alice2").await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));

        // Durable state is untouched and still points at an existing file.
        let unchanged = working.get_user(before.id).await.unwrap();
        assert_eq!(unchanged.username, "alice");
        assert_eq!(unchanged.avatar_url, before.avatar_url);
        assert!(avatars.exists(&unchanged.avatar_url).await);
    }

    #[tokio::test]
    async fn change_password_verifies_old_and_enforces_policy() {
        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();

        let err = fx
            .engine
            .change_password(user.id, "wrongpass1", "newpassword1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IncorrectOldPassword));

        let too_long = "a1".repeat(11);
        for weak in ["short1", "nodigitshere", "bad!password1", too_long.as_str()] {
            let err = fx
                .engine
                .change_password(user.id, "password123", weak)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{:?}", weak);
        }

        fx.engine
            .change_password(user.id, "password123", "newpassword1")
            .await
            .unwrap();

        assert!(fx.engine.authenticate("alice", "newpassword1").await.is_ok());
        assert!(matches!(
            fx.engine.authenticate("alice", "password123").await,
            Err(AppError::Unauthorized)
        ));

        // Password changes never touch the avatar subsystem.
        let unchanged = fx.engine.get_user(user.id).await.unwrap();
        assert_eq!(unchanged.avatar_url, user.avatar_url);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn token_survives_username_change() {
        use crate::auth::{create_access_token, verify_access_token};

        let fx = fixture();

        let user = fx.engine.register("alice", "password123").await.unwrap();
        let token = create_access_token(user.id, "secret", 3600).unwrap();

        fx.engine.change_username(user.id, "renamed").await.unwrap();

        let claims = verify_access_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, user.id);
        let resolved = fx.engine.get_user(claims.sub).await.unwrap();
        assert_eq!(resolved.username, "renamed");
    }

    // The end-to-end walk from the identity subsystem's state machine:
    // default -> renamed default -> custom -> renamed custom -> default.
    #[tokio::test]
    async fn full_identity_flow() {
        let fx = fixture();

        let alice = fx.engine.register("alice", "password123").await.unwrap();
        assert!(alice.is_default_avatar);
        assert!(fx.avatars.exists(&alice.avatar_url).await);

        let alice2 = fx.engine.change_username(alice.id, "alice2").await.unwrap();
        assert_eq!(alice2.username, "alice2");
        assert!(fx.avatars.exists(&alice2.avatar_url).await);
        assert!(!fx.avatars.exists(&alice.avatar_url).await);

        let custom = fx
            .engine
            .upload_avatar(alice.id, b"custom bytes", "png")
            .await
            .unwrap();
        assert!(!custom.is_default_avatar);
        assert!(fx.avatars.exists(&custom.avatar_url).await);

        let alice3 = fx.engine.change_username(alice.id, "alice3").await.unwrap();
        assert_eq!(alice3.username, "alice3");
        assert_eq!(alice3.avatar_url, custom.avatar_url);

        let reverted = fx.engine.delete_avatar(alice.id).await.unwrap();
        assert!(reverted.is_default_avatar);
        assert!(fx.avatars.exists(&reverted.avatar_url).await);
        assert!(!fx.avatars.exists(&custom.avatar_url).await);
        assert_eq!(fx.avatars.file_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_renames_of_same_user_serialize() {
        let fx = fixture();
        let user = fx.engine.register("alice", "password123").await.unwrap();

        let engine = Arc::new(fx.engine);
        let (a, b) = tokio::join!(
            {
                let engine = engine.clone();
                async move { engine.change_username(user.id, "first").await }
            },
            {
                let engine = engine.clone();
                async move { engine.change_username(user.id, "second").await }
            }
        );
        assert!(a.is_ok() && b.is_ok());

        // Whichever rename ran last won; its avatar is the single live file.
        let final_user = engine.get_user(user.id).await.unwrap();
        assert!(fx.avatars.exists(&final_user.avatar_url).await);
        assert!(["first", "second"].contains(&final_user.username.as_str()));
    }

    #[tokio::test]
    async fn idle_user_locks_are_evicted() {
        let fx = fixture();
        let alice = fx.engine.register("alice", "password123").await.unwrap();
        let bob = fx.engine.register("bob", "password123").await.unwrap();

        fx.engine.change_username(alice.id, "alice2").await.unwrap();
        assert_eq!(fx.engine.lock_map_len(), 1);

        // Taking bob's lock prunes alice's idle entry.
        fx.engine.change_username(bob.id, "bob2").await.unwrap();
        assert_eq!(fx.engine.lock_map_len(), 1);
    }
}
