//! Postgres access for the auth service: the pool, the append-only event
//! store and the users read model. In-memory stand-ins live in [`memory`].

mod error;
mod event_store;
pub mod memory;
mod user_views;

pub use error::DbError;
pub use event_store::{EventRow, EventStore, PgEventStore};
pub use memory::{MemoryEventStore, MemoryUserViews};
pub use user_views::{PgUserViews, UserView, UserViewStore, ViewUpdate};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

/// Overrides where migrations are loaded from.
const MIGRATIONS_DIR_ENV: &str = "DCART_MIGRATIONS_DIR";

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/authdb".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
    /// `DB_ACQUIRE_TIMEOUT_SECS`. Unset or unparsable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: Duration::from_secs(env_or(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            ..defaults
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Directories searched for migrations, in order.
fn migration_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var(MIGRATIONS_DIR_ENV) {
        candidates.push(PathBuf::from(dir));
    }
    candidates.push(PathBuf::from("./migrations"));
    candidates.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"));
    candidates
}

fn locate_migrations(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates.iter().find(|dir| dir.is_dir())
}

/// Shared connection pool; cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip_all, fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database pool ready");
        Ok(Self { pool })
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = migration_candidates();
        let Some(dir) = locate_migrations(&candidates) else {
            let tried = candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DbError::MigrationDirNotFound { tried });
        };

        let migrator = Migrator::new(dir.clone())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;

        info!(migrations_dir = %dir.display(), "Migrations applied");
        Ok(())
    }

    pub fn event_store(&self) -> PgEventStore {
        PgEventStore::new(self.pool.clone())
    }

    pub fn user_views(&self) -> PgUserViews {
        PgUserViews::new(self.pool.clone())
    }
}
