use crate::db::Db;
use crate::error::Res;
use crate::model::{BudgetPeriod, Expense, MonthlyAmounts, PeriodStatus};
use anyhow::{bail, Context};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const PERIOD_COLUMNS: &str = "id, owner_id, year, monthly_payment, monthly_payments, \
    previous_year_balance, status, is_template, template_name, template_description, \
    created_at, updated_at";

impl Db {
    /// Inserts a new period. A second non-template period for the same owner and year violates
    /// the unique index and is returned as an error.
    pub async fn insert_period(&self, period: &BudgetPeriod) -> Res<()> {
        let sql = format!(
            "INSERT INTO budget_periods ({PERIOD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        bind_period(sqlx::query(&sql), period)?
            .execute(self.pool())
            .await
            .with_context(|| format!("Failed to insert budget period {}", period.id))?;
        Ok(())
    }

    /// Inserts a new period together with its expenses in one transaction. Used for templates
    /// and for periods created from a template.
    pub async fn insert_period_with_expenses(
        &self,
        period: &BudgetPeriod,
        expenses: &[Expense],
    ) -> Res<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("Failed to begin transaction")?;
        let sql = format!(
            "INSERT INTO budget_periods ({PERIOD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        bind_period(sqlx::query(&sql), period)?
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert budget period {}", period.id))?;
        for expense in expenses {
            super::expenses::insert_expense(&mut *tx, expense).await?;
        }
        tx.commit()
            .await
            .context("Failed to commit budget period")?;
        Ok(())
    }

    /// Overwrites the stored period with the same id.
    pub async fn update_period(&self, period: &BudgetPeriod) -> Res<()> {
        let monthly_payments = MonthlyAmounts::to_optional_json(period.monthly_payments.as_ref())?;
        let result = sqlx::query(
            "UPDATE budget_periods SET owner_id = ?, year = ?, monthly_payment = ?, \
             monthly_payments = ?, previous_year_balance = ?, status = ?, is_template = ?, \
             template_name = ?, template_description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&period.owner_id)
        .bind(period.year)
        .bind(period.monthly_payment)
        .bind(monthly_payments)
        .bind(period.previous_year_balance)
        .bind(period.status.to_string())
        .bind(period.is_template)
        .bind(&period.template_name)
        .bind(&period.template_description)
        .bind(&period.updated_at)
        .bind(&period.id)
        .execute(self.pool())
        .await
        .with_context(|| format!("Failed to update budget period {}", period.id))?;
        if result.rows_affected() == 0 {
            bail!("Budget period {} not found", period.id);
        }
        Ok(())
    }

    pub async fn get_period(&self, id: &str) -> Res<Option<BudgetPeriod>> {
        let sql = format!("SELECT {PERIOD_COLUMNS} FROM budget_periods WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("Failed to read budget period {id}"))?;
        row.as_ref().map(period_from_row).transpose()
    }

    /// All periods of `owner_id`: regular periods newest year first, then templates by name.
    pub async fn list_periods(&self, owner_id: &str) -> Res<Vec<BudgetPeriod>> {
        let sql = format!(
            "SELECT {PERIOD_COLUMNS} FROM budget_periods WHERE owner_id = ? \
             ORDER BY is_template ASC, year DESC, template_name ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(self.pool())
            .await
            .context("Failed to list budget periods")?;
        rows.iter().map(period_from_row).collect()
    }

    /// The non-template period of `owner_id` for `year`, if any.
    pub async fn find_period_by_year(
        &self,
        owner_id: &str,
        year: i32,
    ) -> Res<Option<BudgetPeriod>> {
        let sql = format!(
            "SELECT {PERIOD_COLUMNS} FROM budget_periods \
             WHERE owner_id = ? AND year = ? AND is_template = 0"
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(year)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("Failed to look up budget period for {year}"))?;
        row.as_ref().map(period_from_row).transpose()
    }

    /// Sets the lifecycle status. Returns `false` if no such period exists.
    pub async fn set_period_status(&self, id: &str, status: PeriodStatus) -> Res<bool> {
        let result = sqlx::query(
            "UPDATE budget_periods SET status = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("Failed to set status of budget period {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a period and, by cascade, its expenses. Returns `false` if it did not exist.
    pub async fn delete_period(&self, id: &str) -> Res<bool> {
        let result = sqlx::query("DELETE FROM budget_periods WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .with_context(|| format!("Failed to delete budget period {id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Inserts `period`, or updates every column of the row with the same id.
pub(super) async fn upsert_period(conn: &mut SqliteConnection, period: &BudgetPeriod) -> Res<()> {
    let sql = format!(
        "INSERT INTO budget_periods ({PERIOD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET owner_id = excluded.owner_id, year = excluded.year, \
         monthly_payment = excluded.monthly_payment, monthly_payments = excluded.monthly_payments, \
         previous_year_balance = excluded.previous_year_balance, status = excluded.status, \
         is_template = excluded.is_template, template_name = excluded.template_name, \
         template_description = excluded.template_description, updated_at = excluded.updated_at"
    );
    bind_period(sqlx::query(&sql), period)?
        .execute(conn)
        .await
        .with_context(|| format!("Failed to save budget period {}", period.id))?;
    Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_period<'q>(query: SqliteQuery<'q>, period: &'q BudgetPeriod) -> Res<SqliteQuery<'q>> {
    let monthly_payments = MonthlyAmounts::to_optional_json(period.monthly_payments.as_ref())?;
    Ok(query
        .bind(&period.id)
        .bind(&period.owner_id)
        .bind(period.year)
        .bind(period.monthly_payment)
        .bind(monthly_payments)
        .bind(period.previous_year_balance)
        .bind(period.status.to_string())
        .bind(period.is_template)
        .bind(&period.template_name)
        .bind(&period.template_description)
        .bind(&period.created_at)
        .bind(&period.updated_at))
}

pub(super) fn period_from_row(row: &SqliteRow) -> Res<BudgetPeriod> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let monthly_payments: Option<String> = row.try_get("monthly_payments")?;
    Ok(BudgetPeriod {
        owner_id: row.try_get("owner_id")?,
        year: row.try_get("year")?,
        monthly_payment: row.try_get("monthly_payment")?,
        monthly_payments: MonthlyAmounts::from_optional_json(monthly_payments.as_deref())
            .with_context(|| format!("Budget period {id} has corrupt monthly payments"))?,
        previous_year_balance: row.try_get("previous_year_balance")?,
        status: status
            .parse()
            .with_context(|| format!("Budget period {id} has unknown status '{status}'"))?,
        is_template: row.try_get("is_template")?,
        template_name: row.try_get("template_name")?,
        template_description: row.try_get("template_description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

#[cfg(test)]
mod tests {
    use crate::db::is_unique_violation;
    use crate::db::tests::test_db;
    use crate::model::{BudgetPeriod, Expense, MonthlyAmounts, PeriodStatus};

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_dir, db) = test_db().await;
        let period = BudgetPeriod::new("o", 2025)
            .with_monthly_payment(4500)
            .with_monthly_payments(Some(MonthlyAmounts::new([100; 12])))
            .with_previous_year_balance(-300);
        db.insert_period(&period).await.unwrap();
        let loaded = db.get_period(period.id()).await.unwrap().unwrap();
        assert_eq!(loaded, period);
        assert!(db.get_period("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_year_is_unique_violation() {
        let (_dir, db) = test_db().await;
        db.insert_period(&BudgetPeriod::new("o", 2025)).await.unwrap();
        let err = db
            .insert_period(&BudgetPeriod::new("o", 2025))
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
        // Another owner may use the same year.
        db.insert_period(&BudgetPeriod::new("p", 2025)).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_period_with_expenses() {
        let (_dir, db) = test_db().await;
        let template = BudgetPeriod::new("o", 2025).to_template("Base", None);
        let expense = Expense::new(
            "o",
            template.id(),
            "Rent",
            100,
            crate::model::Frequency::Monthly,
        );
        db.insert_period_with_expenses(&template, &[expense.clone()])
            .await
            .unwrap();
        assert_eq!(db.expenses_for_period(template.id()).await.unwrap(), vec![expense]);

        // An expense for another period fails the foreign key and nothing is kept.
        let other = BudgetPeriod::new("o", 2026);
        let orphan = Expense::new("o", "missing", "Gym", 1, crate::model::Frequency::Monthly);
        assert!(db
            .insert_period_with_expenses(&other, &[orphan])
            .await
            .is_err());
        assert!(db.get_period(other.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_templates_share_sentinel_year() {
        let (_dir, db) = test_db().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        db.insert_period(&period.to_template("A", None)).await.unwrap();
        db.insert_period(&period.to_template("B", None)).await.unwrap();
        let all = db.list_periods("o").await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(!all[0].is_template());
        assert_eq!(all[1].template_name(), Some("A"));
        assert_eq!(all[2].template_name(), Some("B"));
    }

    #[tokio::test]
    async fn test_status_and_update() {
        let (_dir, db) = test_db().await;
        let mut period = BudgetPeriod::new("o", 2024);
        db.insert_period(&period).await.unwrap();
        assert!(db
            .set_period_status(period.id(), PeriodStatus::Archived)
            .await
            .unwrap());
        assert_eq!(
            db.get_period(period.id()).await.unwrap().unwrap().status(),
            PeriodStatus::Archived
        );
        assert!(!db
            .set_period_status("missing", PeriodStatus::Active)
            .await
            .unwrap());

        period.monthly_payment = 9000;
        db.update_period(&period).await.unwrap();
        let loaded = db.get_period(period.id()).await.unwrap().unwrap();
        assert_eq!(loaded.monthly_payment(), 9000);

        let missing = BudgetPeriod::new("o", 2030);
        assert!(db.update_period(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_year_ignores_templates() {
        let (_dir, db) = test_db().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period.to_template("T", None)).await.unwrap();
        assert!(db.find_period_by_year("o", 2025).await.unwrap().is_none());
        db.insert_period(&period).await.unwrap();
        let found = db.find_period_by_year("o", 2025).await.unwrap().unwrap();
        assert_eq!(found.id(), period.id());
    }
}
