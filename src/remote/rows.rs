//! Conversion between local model types and remote rows.
//!
//! The remote store names the owner `user_id` and an expense's parent `budget_period_id`, and
//! keeps the 12-month arrays as JSON text. Rows written by older clients may carry the arrays
//! as real JSON arrays, so both forms are accepted when reading.

use crate::db::LegacySettings;
use crate::error::Res;
use crate::model::{now_timestamp, BudgetPeriod, Expense, Frequency, MonthlyAmounts, PeriodStatus};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const ID: &str = "id";
pub(crate) const OWNER: &str = "user_id";
pub(crate) const PERIOD: &str = "budget_period_id";

/// Conflict key for regular periods: one per owner and year.
pub(crate) const PERIOD_NATURAL_KEY: &str = "user_id,year";
/// Conflict key for templates, which all share the sentinel year.
pub(crate) const TEMPLATE_KEY: &str = "id";
pub(crate) const SETTINGS_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PeriodRow {
    id: String,
    user_id: String,
    year: i32,
    #[serde(default)]
    monthly_payment: i64,
    #[serde(default)]
    monthly_payments: Option<Value>,
    #[serde(default)]
    previous_year_balance: i64,
    #[serde(default)]
    status: PeriodStatus,
    #[serde(default)]
    is_template: bool,
    #[serde(default)]
    template_name: Option<String>,
    #[serde(default)]
    template_description: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExpenseRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    user_id: String,
    budget_period_id: Option<String>,
    name: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    frequency: Frequency,
    #[serde(default = "first_month")]
    start_month: u8,
    #[serde(default = "last_month")]
    end_month: u8,
    #[serde(default)]
    monthly_amounts: Option<Value>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SettingsRow {
    user_id: String,
    #[serde(default)]
    monthly_payment: i64,
    #[serde(default)]
    previous_balance: i64,
    #[serde(default)]
    monthly_payments: Option<Value>,
    #[serde(default)]
    updated_at: Option<String>,
}

fn first_month() -> u8 {
    1
}

fn last_month() -> u8 {
    12
}

fn amounts_to_value(amounts: Option<&MonthlyAmounts>) -> Res<Option<Value>> {
    Ok(MonthlyAmounts::to_optional_json(amounts)?.map(Value::String))
}

fn amounts_from_value(value: Option<&Value>) -> Res<Option<MonthlyAmounts>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => MonthlyAmounts::from_optional_json(Some(text.as_str())),
        Some(array @ Value::Array(_)) => Ok(Some(
            serde_json::from_value(array.clone()).context("Invalid monthly amounts array")?,
        )),
        Some(other) => bail!("Expected monthly amounts as JSON text or an array, got {other}"),
    }
}

pub(crate) fn period_to_row(period: &BudgetPeriod) -> Res<Value> {
    let row = PeriodRow {
        id: period.id.clone(),
        user_id: period.owner_id.clone(),
        year: period.year,
        monthly_payment: period.monthly_payment,
        monthly_payments: amounts_to_value(period.monthly_payments.as_ref())?,
        previous_year_balance: period.previous_year_balance,
        status: period.status,
        is_template: period.is_template,
        template_name: period.template_name.clone(),
        template_description: period.template_description.clone(),
        created_at: Some(period.created_at.clone()),
        updated_at: Some(period.updated_at.clone()),
    };
    serde_json::to_value(row).context("Unable to serialize budget period")
}

pub(crate) fn period_from_row(row: &Value) -> Res<BudgetPeriod> {
    let row: PeriodRow =
        serde_json::from_value(row.clone()).context("Invalid budget period row")?;
    let now = now_timestamp();
    Ok(BudgetPeriod {
        monthly_payments: amounts_from_value(row.monthly_payments.as_ref())
            .with_context(|| format!("Budget period {} has invalid monthly payments", row.id))?,
        id: row.id,
        owner_id: row.user_id,
        year: row.year,
        monthly_payment: row.monthly_payment,
        previous_year_balance: row.previous_year_balance,
        status: row.status,
        is_template: row.is_template,
        template_name: row.template_name,
        template_description: row.template_description,
        created_at: row.created_at.unwrap_or_else(|| now.clone()),
        updated_at: row.updated_at.unwrap_or(now),
    })
}

/// Expense rows are written without an id: the remote store assigns a fresh one on insert.
pub(crate) fn expense_to_row(expense: &Expense) -> Res<Value> {
    let row = ExpenseRow {
        id: None,
        user_id: expense.owner_id.clone(),
        budget_period_id: Some(expense.period_id.clone()),
        name: expense.name.clone(),
        amount: expense.amount,
        frequency: expense.frequency,
        start_month: expense.start_month,
        end_month: expense.end_month,
        monthly_amounts: amounts_to_value(expense.monthly_amounts.as_ref())?,
        created_at: Some(expense.created_at.clone()),
        updated_at: Some(expense.updated_at.clone()),
    };
    serde_json::to_value(row).context("Unable to serialize expense")
}

/// Returns `None` for rows that have no parent period; they cannot be stored locally.
pub(crate) fn expense_from_row(row: &Value) -> Res<Option<Expense>> {
    let row: ExpenseRow = serde_json::from_value(row.clone()).context("Invalid expense row")?;
    let Some(period_id) = row.budget_period_id else {
        return Ok(None);
    };
    let id = row.id.context("An expense row has no id")?;
    let now = now_timestamp();
    let mut expense = Expense {
        monthly_amounts: amounts_from_value(row.monthly_amounts.as_ref())
            .with_context(|| format!("Expense {id} has invalid monthly amounts"))?,
        id,
        owner_id: row.user_id,
        period_id,
        name: row.name,
        amount: row.amount,
        frequency: row.frequency,
        start_month: row.start_month,
        end_month: row.end_month,
        created_at: row.created_at.unwrap_or_else(|| now.clone()),
        updated_at: row.updated_at.unwrap_or(now),
    };
    expense.normalize();
    Ok(Some(expense))
}

pub(crate) fn settings_to_row(settings: &LegacySettings) -> Res<Value> {
    let row = SettingsRow {
        user_id: settings.owner_id.clone(),
        monthly_payment: settings.monthly_payment,
        previous_balance: settings.previous_balance,
        monthly_payments: amounts_to_value(settings.monthly_payments.as_ref())?,
        updated_at: Some(settings.updated_at.clone()),
    };
    serde_json::to_value(row).context("Unable to serialize settings")
}

pub(crate) fn settings_from_row(row: &Value) -> Res<LegacySettings> {
    let row: SettingsRow = serde_json::from_value(row.clone()).context("Invalid settings row")?;
    Ok(LegacySettings {
        monthly_payments: amounts_from_value(row.monthly_payments.as_ref())?,
        owner_id: row.user_id,
        monthly_payment: row.monthly_payment,
        previous_balance: row.previous_balance,
        updated_at: row.updated_at.unwrap_or_else(now_timestamp),
    })
}

/// Reads the string column `name` from a row.
pub(crate) fn text<'a>(row: &'a Value, name: &str) -> Option<&'a str> {
    row.get(name).and_then(Value::as_str)
}
