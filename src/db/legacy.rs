//! Expenses and settings from before budget periods existed.

use crate::db::{periods, Db};
use crate::error::Res;
use crate::model::{now_timestamp, BudgetPeriod, MonthlyAmounts};
use anyhow::Context;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

/// The per-owner settings row. Its values seed the period that legacy expenses are moved into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySettings {
    pub(crate) owner_id: String,
    pub(crate) monthly_payment: i64,
    pub(crate) previous_balance: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) monthly_payments: Option<MonthlyAmounts>,
    pub(crate) updated_at: String,
}

impl LegacySettings {
    pub fn new(owner_id: impl Into<String>, monthly_payment: i64, previous_balance: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            monthly_payment,
            previous_balance,
            monthly_payments: None,
            updated_at: now_timestamp(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn monthly_payment(&self) -> i64 {
        self.monthly_payment
    }

    pub fn previous_balance(&self) -> i64 {
        self.previous_balance
    }

    pub fn monthly_payments(&self) -> Option<&MonthlyAmounts> {
        self.monthly_payments.as_ref()
    }
}

/// What `Db::migrate_legacy_data` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyMigration {
    /// No expense lacked a period.
    NotNeeded,
    Migrated {
        period_id: String,
        created_period: bool,
        expenses: u64,
    },
}

impl Db {
    pub async fn get_settings(&self, owner_id: &str) -> Res<Option<LegacySettings>> {
        let row = sqlx::query(
            "SELECT owner_id, monthly_payment, previous_balance, monthly_payments, updated_at \
             FROM settings WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to read settings")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let monthly_payments: Option<String> = row.try_get("monthly_payments")?;
        Ok(Some(LegacySettings {
            owner_id: row.try_get("owner_id")?,
            monthly_payment: row.try_get("monthly_payment")?,
            previous_balance: row.try_get("previous_balance")?,
            monthly_payments: MonthlyAmounts::from_optional_json(monthly_payments.as_deref())
                .context("The settings row has corrupt monthly payments")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn upsert_settings(&self, settings: &LegacySettings) -> Res<()> {
        let monthly_payments =
            MonthlyAmounts::to_optional_json(settings.monthly_payments.as_ref())?;
        sqlx::query(
            "INSERT INTO settings (owner_id, monthly_payment, previous_balance, monthly_payments, \
             updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(owner_id) DO UPDATE SET monthly_payment = excluded.monthly_payment, \
             previous_balance = excluded.previous_balance, \
             monthly_payments = excluded.monthly_payments, updated_at = excluded.updated_at",
        )
        .bind(&settings.owner_id)
        .bind(settings.monthly_payment)
        .bind(settings.previous_balance)
        .bind(monthly_payments)
        .bind(&settings.updated_at)
        .execute(self.pool())
        .await
        .context("Failed to save settings")?;
        Ok(())
    }

    /// Attaches every expense of `owner_id` that has no period to the period for the current
    /// year, creating that period from the legacy settings if it does not exist. Running it again
    /// after it has succeeded does nothing.
    pub async fn migrate_legacy_data(&self, owner_id: &str) -> Res<LegacyMigration> {
        self.migrate_legacy_data_into(owner_id, chrono::Local::now().year())
            .await
    }

    pub(crate) async fn migrate_legacy_data_into(
        &self,
        owner_id: &str,
        year: i32,
    ) -> Res<LegacyMigration> {
        // Read before the transaction takes the pool's only connection.
        let settings = self.get_settings(owner_id).await?;
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let orphans: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM expenses WHERE owner_id = ? AND period_id IS NULL",
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to count expenses without a budget period")?
        .try_get("n")?;
        if orphans == 0 {
            return Ok(LegacyMigration::NotNeeded);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM budget_periods WHERE owner_id = ? AND year = ? AND is_template = 0",
        )
        .bind(owner_id)
        .bind(year)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to look up the current budget period")?;

        let (period_id, created_period) = match existing {
            Some((id,)) => (id, false),
            None => {
                let period = match settings {
                    Some(s) => BudgetPeriod::new(owner_id, year)
                        .with_monthly_payment(s.monthly_payment)
                        .with_monthly_payments(s.monthly_payments)
                        .with_previous_year_balance(s.previous_balance),
                    None => BudgetPeriod::new(owner_id, year),
                };
                periods::upsert_period(&mut *tx, &period).await?;
                (period.id, true)
            }
        };

        let moved = sqlx::query(
            "UPDATE expenses SET period_id = ? WHERE owner_id = ? AND period_id IS NULL",
        )
        .bind(&period_id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .context("Failed to attach expenses to the budget period")?
        .rows_affected();

        tx.commit()
            .await
            .context("Failed to commit the legacy data migration")?;
        info!("Moved {moved} expense(s) without a budget period into {year}");
        Ok(LegacyMigration::Migrated {
            period_id,
            created_period,
            expenses: moved,
        })
    }
}
