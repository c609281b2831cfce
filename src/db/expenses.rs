use crate::db::Db;
use crate::error::Res;
use crate::model::{Expense, MonthlyAmounts};
use anyhow::{bail, Context};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const EXPENSE_COLUMNS: &str = "id, owner_id, period_id, name, amount, frequency, start_month, \
    end_month, monthly_amounts, created_at, updated_at";

impl Db {
    /// Inserts a new expense. The referenced period must exist locally.
    pub async fn insert_expense(&self, expense: &Expense) -> Res<()> {
        let mut conn = self
            .pool()
            .acquire()
            .await
            .context("Failed to acquire a database connection")?;
        insert_expense(&mut conn, expense).await
    }

    /// Overwrites the stored expense with the same id.
    pub async fn update_expense(&self, expense: &Expense) -> Res<()> {
        let monthly_amounts = MonthlyAmounts::to_optional_json(expense.monthly_amounts.as_ref())?;
        let result = sqlx::query(
            "UPDATE expenses SET period_id = ?, name = ?, amount = ?, frequency = ?, \
             start_month = ?, end_month = ?, monthly_amounts = ?, updated_at = ? \
             WHERE id = ? AND owner_id = ?",
        )
        .bind(&expense.period_id)
        .bind(&expense.name)
        .bind(expense.amount)
        .bind(expense.frequency.to_string())
        .bind(i64::from(expense.start_month))
        .bind(i64::from(expense.end_month))
        .bind(monthly_amounts)
        .bind(&expense.updated_at)
        .bind(&expense.id)
        .bind(&expense.owner_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("Failed to update expense {}", expense.id))?;
        if result.rows_affected() == 0 {
            bail!("Expense {} not found", expense.id);
        }
        Ok(())
    }

    /// Deletes an expense of `owner_id`. Returns `false` if it did not exist.
    pub async fn delete_expense(&self, owner_id: &str, id: &str) -> Res<bool> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(self.pool())
            .await
            .with_context(|| format!("Failed to delete expense {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_expense(&self, id: &str) -> Res<Option<Expense>> {
        let sql = format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ? AND period_id IS NOT NULL"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("Failed to read expense {id}"))?;
        row.as_ref().map(expense_from_row).transpose()
    }

    /// All expenses of `owner_id` that belong to a period, ordered by name. Rows left over from
    /// before periods existed are not returned until they have been migrated.
    pub async fn list_expenses(&self, owner_id: &str) -> Res<Vec<Expense>> {
        let sql = format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses \
             WHERE owner_id = ? AND period_id IS NOT NULL ORDER BY name COLLATE NOCASE, id"
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(self.pool())
            .await
            .context("Failed to list expenses")?;
        rows.iter().map(expense_from_row).collect()
    }

    pub async fn expenses_for_period(&self, period_id: &str) -> Res<Vec<Expense>> {
        let sql = format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses \
             WHERE period_id = ? ORDER BY name COLLATE NOCASE, id"
        );
        let rows = sqlx::query(&sql)
            .bind(period_id)
            .fetch_all(self.pool())
            .await
            .with_context(|| format!("Failed to list expenses of budget period {period_id}"))?;
        rows.iter().map(expense_from_row).collect()
    }
}

pub(super) async fn insert_expense(conn: &mut SqliteConnection, expense: &Expense) -> Res<()> {
    let monthly_amounts = MonthlyAmounts::to_optional_json(expense.monthly_amounts.as_ref())?;
    let sql = format!(
        "INSERT INTO expenses ({EXPENSE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&expense.id)
        .bind(&expense.owner_id)
        .bind(&expense.period_id)
        .bind(&expense.name)
        .bind(expense.amount)
        .bind(expense.frequency.to_string())
        .bind(i64::from(expense.start_month))
        .bind(i64::from(expense.end_month))
        .bind(monthly_amounts)
        .bind(&expense.created_at)
        .bind(&expense.updated_at)
        .execute(conn)
        .await
        .with_context(|| format!("Failed to insert expense {}", expense.id))?;
    Ok(())
}

fn month(row: &SqliteRow, column: &str) -> Res<u8> {
    let value: i64 = row.try_get(column)?;
    u8::try_from(value).with_context(|| format!("Column {column} holds an invalid month {value}"))
}

fn expense_from_row(row: &SqliteRow) -> Res<Expense> {
    let id: String = row.try_get("id")?;
    let frequency: String = row.try_get("frequency")?;
    let monthly_amounts: Option<String> = row.try_get("monthly_amounts")?;
    Ok(Expense {
        owner_id: row.try_get("owner_id")?,
        period_id: row.try_get("period_id")?,
        name: row.try_get("name")?,
        amount: row.try_get("amount")?,
        frequency: frequency
            .parse()
            .with_context(|| format!("Expense {id} has unknown frequency '{frequency}'"))?,
        start_month: month(row, "start_month")?,
        end_month: month(row, "end_month")?,
        monthly_amounts: MonthlyAmounts::from_optional_json(monthly_amounts.as_deref())
            .with_context(|| format!("Expense {id} has corrupt monthly amounts"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}
