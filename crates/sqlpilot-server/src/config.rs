use std::env;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expires_in: i64,
    pub port: u16,
    pub uploads_dir: String,
    pub avatars_dir: String,
    pub password_policy: PasswordPolicy,
}

/// New-password rules. Values come from the environment so deployments can
/// tighten them without a rebuild.
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_digit: bool,
    pub alphanumeric_only: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 20,
            require_digit: true,
            alphanumeric_only: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let uploads_dir = env::var("UPLOADS_DIR").unwrap_or_else(|_| "uploads".to_string());
        let avatars_dir = format!("{}/avatars", uploads_dir);

        let defaults = PasswordPolicy::default();
        let password_policy = PasswordPolicy {
            min_length: env::var("PASSWORD_MIN_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_length),
            max_length: env::var("PASSWORD_MAX_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_length),
            require_digit: env::var("PASSWORD_REQUIRE_DIGIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.require_digit),
            alphanumeric_only: env::var("PASSWORD_ALPHANUMERIC_ONLY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.alphanumeric_only),
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_expires_in: env::var("JWT_EXPIRES_IN")
                .unwrap_or_else(|_| "691200".to_string()) // 8 days
                .parse()?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            uploads_dir,
            avatars_dir,
            password_policy,
        })
    }
}
