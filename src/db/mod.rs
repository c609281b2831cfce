//! This module is responsible for reading, writing and managing the SQLite database that holds
//! budget periods, expenses and sync metadata on this device.
//!
//! A `Db` is an explicitly constructed handle around a connection pool. It is cheap to clone and
//! every component that needs the local store is handed one.

mod expenses;
mod legacy;
pub(crate) mod migrations;
mod periods;

pub use legacy::{LegacyMigration, LegacySettings};

use crate::error::Res;
use crate::model::BudgetData;
use anyhow::{bail, Context};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// A value bound to a `?` placeholder in `Db::query`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

/// The local store.
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// - Validates that no file currently exists at `path`
    /// - Creates a new SQLite file at `path`
    /// - Initializes the database schema
    pub async fn init(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if path.exists() {
            bail!("A database already exists at {}", path.display());
        }
        let db = Self::open(path, true).await?;
        db.initialize().await?;
        Ok(db)
    }

    /// - Validates that there is a SQLite file at `path`
    /// - Opens a connection pool
    /// - Brings the schema up to date
    pub async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("The database file is missing '{}'", path.display());
        }
        let db = Self::open(path, false).await?;
        db.initialize().await?;
        Ok(db)
    }

    async fn open(path: &Path, create: bool) -> Res<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .context("Failed to parse SQLite connection string")?
            .create_if_missing(create)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Unable to open the SQLite database at {}", path.display()))?;

        Ok(Self { pool })
    }

    /// Creates tables if absent, adds columns that older databases lack, and creates the
    /// supporting indexes. Safe to call any number of times.
    pub async fn initialize(&self) -> Res<()> {
        let version = migrations::current_version(&self.pool).await?;
        migrations::run(&self.pool, version, migrations::CURRENT_VERSION).await?;
        let added = migrations::evolve_columns(&self.pool).await?;
        if added > 0 {
            debug!("Added {added} missing column(s) to the local store");
        }
        migrations::create_indexes(&self.pool).await?;
        Ok(())
    }

    /// Runs `sql` with `params` bound to its placeholders and returns the raw rows. Callers must
    /// pass values through `params` rather than formatting them into `sql`.
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Res<Vec<SqliteRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                SqlParam::Null => query.bind(None::<String>),
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::Real(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }
        query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Query failed: {sql}"))
    }

    /// Executes one or more statements without parameters. Returns the number of rows affected.
    pub async fn exec(&self, sql: &str) -> Res<u64> {
        let result = (&self.pool)
            .execute(sql)
            .await
            .with_context(|| format!("Statement failed: {sql}"))?;
        Ok(result.rows_affected())
    }

    /// Reads a value from the `sync_metadata` table.
    pub async fn get_metadata(&self, key: &str) -> Res<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read sync metadata '{key}'"))?;
        Ok(row.map(|r| r.0))
    }

    /// Writes a value to the `sync_metadata` table.
    pub async fn set_metadata(&self, key: &str, value: &str) -> Res<()> {
        sqlx::query(
            "INSERT INTO sync_metadata (key, value, updated_at) \
             VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write sync metadata '{key}'"))?;
        Ok(())
    }

    /// Loads both collections for `owner_id`.
    pub async fn load_budget_data(&self, owner_id: &str) -> Res<BudgetData> {
        let periods = self.list_periods(owner_id).await?;
        let expenses = self.list_expenses(owner_id).await?;
        Ok(BudgetData { periods, expenses })
    }

    /// Makes the owner's local collections equal to `data` in a single transaction:
    /// - periods not in `data` are deleted (their expenses cascade)
    /// - periods in `data` are inserted or updated by id
    /// - the owner's expenses are replaced wholesale by `data.expenses`
    pub async fn replace_budget_data(&self, owner_id: &str, data: &BudgetData) -> Res<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM expenses WHERE owner_id = ?")
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear local expenses")?;

        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM budget_periods WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_all(&mut *tx)
                .await
                .context("Failed to list local budget periods")?;
        for (id,) in existing {
            if !data.periods.iter().any(|p| p.id == id) {
                sqlx::query("DELETE FROM budget_periods WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to delete budget period {id}"))?;
            }
        }

        for period in &data.periods {
            periods::upsert_period(&mut *tx, period).await?;
        }
        for expense in &data.expenses {
            expenses::insert_expense(&mut *tx, expense).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit budget data")?;
        debug!(
            "Replaced local data for {owner_id}: {} period(s), {} expense(s)",
            data.periods.len(),
            data.expenses.len()
        );
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Returns `true` if `e` is a SQLite uniqueness violation.
pub(crate) fn is_unique_violation(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .map(|e| e.is_unique_violation())
            .unwrap_or(false)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{BudgetPeriod, Expense, Frequency};
    use sqlx::Row;
    use tempfile::TempDir;

    /// Creates a fresh database in a temporary directory.
    pub(crate) async fn test_db() -> (TempDir, Db) {
        let dir = TempDir::new().unwrap();
        let db = Db::init(dir.path().join("budget.sqlite")).await.unwrap();
        (dir, db)
    }

    async fn schema_snapshot(db: &Db) -> Vec<(String, String)> {
        let rows = db
            .query(
                "SELECT name, COALESCE(sql, '') AS sql FROM sqlite_master ORDER BY name",
                &[],
            )
            .await
            .unwrap();
        rows.iter()
            .map(|r| (r.get::<String, _>("name"), r.get::<String, _>("sql")))
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (_dir, db) = test_db().await;
        let before = schema_snapshot(&db).await;
        db.initialize().await.unwrap();
        db.initialize().await.unwrap();
        let after = schema_snapshot(&db).await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_init_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("budget.sqlite");
        let _db = Db::init(&path).await.unwrap();
        assert!(Db::init(&path).await.is_err());
        assert!(Db::load(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Db::load(dir.path().join("nope.sqlite")).await.is_err());
    }

    #[tokio::test]
    async fn test_indexes_exist() {
        let (_dir, db) = test_db().await;
        let rows = db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                &[],
            )
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
        for expected in [
            "idx_budget_periods_owner_year",
            "idx_budget_periods_owner_status",
            "idx_budget_periods_owner_template",
            "idx_expenses_period",
            "idx_expenses_frequency",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_query_and_exec_pass_through() {
        let (_dir, db) = test_db().await;
        let affected = db
            .exec("INSERT INTO sync_metadata (key, value) VALUES ('a', '1'), ('b', '2')")
            .await
            .unwrap();
        assert_eq!(affected, 2);
        let rows = db
            .query(
                "SELECT value FROM sync_metadata WHERE key = ?",
                &[SqlParam::from("b")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String, _>("value"), "2");
        assert!(db.query("SELECT * FROM missing_table", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_metadata() {
        let (_dir, db) = test_db().await;
        assert_eq!(db.get_metadata("last_sync:o").await.unwrap(), None);
        db.set_metadata("last_sync:o", "x").await.unwrap();
        db.set_metadata("last_sync:o", "y").await.unwrap();
        assert_eq!(
            db.get_metadata("last_sync:o").await.unwrap().as_deref(),
            Some("y")
        );
    }

    #[tokio::test]
    async fn test_replace_budget_data() {
        let (_dir, db) = test_db().await;
        let old = BudgetPeriod::new("o", 2024);
        db.insert_period(&old).await.unwrap();
        db.insert_expense(&Expense::new("o", old.id(), "Old", 1, Frequency::Monthly))
            .await
            .unwrap();

        let keep = BudgetPeriod::new("o", 2025);
        let expense = Expense::new("o", keep.id(), "Rent", 5000, Frequency::Monthly);
        let data = BudgetData::new(vec![keep.clone()], vec![expense.clone()]);
        db.replace_budget_data("o", &data).await.unwrap();

        let loaded = db.load_budget_data("o").await.unwrap();
        assert_eq!(loaded.periods().len(), 1);
        assert_eq!(loaded.periods()[0].id(), keep.id());
        assert_eq!(loaded.expenses(), &[expense]);
    }

    #[tokio::test]
    async fn test_replace_budget_data_leaves_other_owners_alone() {
        let (_dir, db) = test_db().await;
        let theirs = BudgetPeriod::new("other", 2025);
        db.insert_period(&theirs).await.unwrap();
        db.replace_budget_data("o", &BudgetData::default())
            .await
            .unwrap();
        assert_eq!(db.list_periods("other").await.unwrap().len(), 1);
    }
}
