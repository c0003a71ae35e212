use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Secrets that ship in sample env files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "",
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub token_ttl: chrono::Duration,
    pub seed_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = var("LYCEUM_JWT_SECRET").unwrap_or_default();
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("LYCEUM_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let db_path = var("LYCEUM_DB_PATH").unwrap_or_else(|| "lyceum.db".into());
        let host = var("LYCEUM_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("LYCEUM_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("LYCEUM_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        let ttl_hours: i64 = var("LYCEUM_TOKEN_TTL_HOURS")
            .unwrap_or_else(|| "720".into())
            .parse()
            .context("LYCEUM_TOKEN_TTL_HOURS must be a whole number of hours")?;
        if ttl_hours <= 0 {
            bail!("LYCEUM_TOKEN_TTL_HOURS must be positive");
        }

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(db_path),
            addr,
            token_ttl: chrono::Duration::hours(ttl_hours),
            seed_path: var("LYCEUM_SEED_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }
}
