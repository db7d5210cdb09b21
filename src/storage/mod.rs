//! Postgres-backed persistence: pool bootstrap, migrations, and stores.

mod events;
mod groups;

pub use events::{EventFilter, EventStore};
pub use groups::{GroupFilter, GroupStore};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::Result;

/// Ordered schema migrations, applied lexicographically by file name.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_events.sql",
        include_str!("migrations/0001_events.sql"),
    ),
    (
        "0002_groups.sql",
        include_str!("migrations/0002_groups.sql"),
    ),
];

/// Open a connection pool against `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply every embedded migration in order. Statements are idempotent, so
/// reapplying on boot is safe.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        tracing::debug!(migration = %name, "applying migration");
        sqlx::raw_sql(sql).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_lexicographically_ordered() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn migrations_are_non_empty_sql() {
        for (name, sql) in MIGRATIONS {
            assert!(
                sql.contains("CREATE TABLE IF NOT EXISTS"),
                "{name} should create tables idempotently"
            );
        }
    }
}
