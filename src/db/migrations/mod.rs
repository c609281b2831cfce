//! Database schema migrations.
//!
//! Schema changes come in two flavors:
//! - Versioned migrations, stored in this directory as `migration_NN_up.sql` (upgrades from
//!   version `NN-1` to `NN`) and `migration_NN_down.sql` (downgrades from `NN` to `NN-1`).
//! - Guarded column additions for databases whose tables were created by earlier builds, before
//!   the schema was versioned. Each column is added only if `pragma_table_info` does not list it.
//!
//! Indexes are created last with `IF NOT EXISTS`, because some of them cover evolved columns.

use crate::error::Res;
use anyhow::{bail, Context};
use sqlx::{Executor, SqlitePool};
use tracing::debug;

/// The schema version this build expects.
pub(crate) const CURRENT_VERSION: i32 = 1;

/// A database migration with up and down SQL.
struct Migration {
    /// The version this migration brings the database to (when going up).
    version: i32,
    /// SQL to execute when upgrading to this version.
    up_sql: &'static str,
    /// SQL to execute when downgrading from this version.
    down_sql: &'static str,
}

/// All available migrations in order.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("migration_01_up.sql"),
    down_sql: include_str!("migration_01_down.sql"),
}];

/// Columns that were added after the first release of a table: `(table, column, definition)`.
const EVOLVED_COLUMNS: &[(&str, &str, &str)] = &[
    (
        "expenses",
        "period_id",
        "TEXT REFERENCES budget_periods (id) ON DELETE CASCADE",
    ),
    ("expenses", "monthly_amounts", "TEXT"),
    ("budget_periods", "monthly_payments", "TEXT"),
    ("budget_periods", "is_template", "INTEGER NOT NULL DEFAULT 0"),
    ("budget_periods", "template_name", "TEXT"),
    ("budget_periods", "template_description", "TEXT"),
    ("settings", "monthly_payments", "TEXT"),
];

const INDEXES_SQL: &str = include_str!("indexes.sql");

/// Creates the `schema_version` table if needed and returns the version it holds.
pub(crate) async fn current_version(pool: &SqlitePool) -> Res<i32> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .context("Failed to create schema_version table")?;

    let row: (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .context("Failed to query schema version")?;

    match row.0 {
        Some(version) => Ok(version),
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
                .execute(pool)
                .await
                .context("Failed to insert initial schema version")?;
            Ok(0)
        }
    }
}

/// Runs migrations to bring the database from `current_version` to `target_version`.
///
/// - If `current_version < target_version`, runs "up" migrations sequentially.
/// - If `current_version > target_version`, runs "down" migrations sequentially.
/// - Each migration is executed within a transaction that includes the schema_version update.
///
/// Validates all required migrations exist before running any of them.
pub(crate) async fn run(pool: &SqlitePool, current_ver: i32, target_ver: i32) -> Res<()> {
    if current_ver == target_ver {
        debug!("Database already at target version {target_ver}, no migrations needed");
        return Ok(());
    }

    validate_migrations(current_ver, target_ver)?;

    if current_ver < target_ver {
        for version in (current_ver + 1)..=target_ver {
            let migration = find(version)?;
            debug!("Running migration {version:02} (up)");
            run_single_migration(pool, migration.up_sql, version).await?;
        }
    } else {
        for version in (target_ver + 1..=current_ver).rev() {
            let migration = find(version)?;
            debug!("Running migration {version:02} (down)");
            run_single_migration(pool, migration.down_sql, version - 1).await?;
        }
    }

    debug!("Migration complete, schema now at version {target_ver}");
    Ok(())
}

/// Adds any column from `EVOLVED_COLUMNS` that its table lacks. Returns the number of columns
/// added, which is zero on an up-to-date database.
pub(crate) async fn evolve_columns(pool: &SqlitePool) -> Res<usize> {
    let mut added = 0;
    for (table, column, definition) in EVOLVED_COLUMNS {
        if column_exists(pool, table, column).await? {
            continue;
        }
        debug!("Adding missing column {table}.{column}");
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
        pool.execute(sql.as_str())
            .await
            .with_context(|| format!("Failed to add column {table}.{column}"))?;
        added += 1;
    }
    Ok(added)
}

/// Creates the supporting indexes. Safe to call repeatedly.
pub(crate) async fn create_indexes(pool: &SqlitePool) -> Res<()> {
    pool.execute(INDEXES_SQL)
        .await
        .context("Failed to create indexes")?;
    Ok(())
}

pub(crate) async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Res<bool> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await
            .with_context(|| format!("Failed to inspect columns of {table}"))?;
    Ok(row.0 > 0)
}

fn find(version: i32) -> Res<&'static Migration> {
    MIGRATIONS
        .iter()
        .find(|m| m.version == version)
        .with_context(|| format!("Migration {version} not found"))
}

/// Executes a single migration's SQL and updates schema_version, all within a transaction.
async fn run_single_migration(pool: &SqlitePool, sql: &str, new_version: i32) -> Res<()> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin migration transaction")?;

    tx.execute(sql)
        .await
        .context("Failed to execute migration SQL")?;

    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await
        .context("Failed to clear schema_version")?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(new_version)
        .execute(&mut *tx)
        .await
        .context("Failed to update schema_version")?;

    tx.commit()
        .await
        .context("Failed to commit migration transaction")?;

    Ok(())
}

/// Validates that migrations are available for all versions needed to go from
/// `current_version` to `target_version`.
fn validate_migrations(current_version: i32, target_version: i32) -> Res<()> {
    let (start, end) = if current_version < target_version {
        (current_version + 1, target_version)
    } else {
        (target_version + 1, current_version)
    };

    for version in start..=end {
        if !MIGRATIONS.iter().any(|m| m.version == version) {
            bail!(
                "Migration {version} is missing but required to migrate from version {current_version} to {target_version}"
            );
        }
    }

    Ok(())
}
