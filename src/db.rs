use sqlx::{mysql::MySqlPoolOptions, postgres::PgPoolOptions, MySqlPool, PgPool};
use std::time::Duration;

use crate::errors::{MigrationError, ResultExt};

/// Connection to the legacy store.
///
/// Workers each open their own instance with a single connection, so no
/// connection is ever shared between two workers.
pub struct LegacyDatabase {
    pub pool: MySqlPool,
}

impl LegacyDatabase {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to legacy store")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("pinging legacy store")?;

        Ok(Self { pool })
    }
}

/// Connection to the destination store.
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to destination store")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("pinging destination store")?;

        Ok(Self { pool })
    }
}
