//! Budget period command handlers.

use crate::args::{CreatePeriodArgs, IdArgs};
use crate::commands::{loaded, plural, Out};
use crate::model::{format_kroner, BudgetPeriod, Expense, PeriodStatus};
use crate::{BudgetEngine, Config, Mode, Result};
use serde::Serialize;
use std::collections::HashMap;

/// One line of `budget period list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodSummary {
    pub id: String,
    pub year: i32,
    pub status: PeriodStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    pub expense_count: usize,
    pub annual_payments: i64,
    pub annual_expenses: i64,
    /// The previous year's balance plus payments minus expenses.
    pub year_end_balance: i64,
}

impl PeriodSummary {
    fn new(period: &BudgetPeriod, expenses: &[&Expense]) -> Self {
        let annual_expenses = expenses
            .iter()
            .fold(0, |total: i64, e| total.saturating_add(e.annual_total()));
        let annual_payments = period.annual_payments();
        Self {
            id: period.id().to_string(),
            year: period.year(),
            status: period.status(),
            template_name: period.template_name().map(str::to_string),
            expense_count: expenses.len(),
            annual_payments,
            annual_expenses,
            year_end_balance: period
                .previous_year_balance()
                .saturating_add(annual_payments)
                .saturating_sub(annual_expenses),
        }
    }

    fn line(&self) -> String {
        let label = match &self.template_name {
            Some(name) => format!("template '{name}'"),
            None => format!("{} ({})", self.year, self.status),
        };
        format!(
            "{}  {label}: {} expense{}, payments {}, expenses {}, balance {}",
            self.id,
            self.expense_count,
            plural(self.expense_count),
            format_kroner(self.annual_payments),
            format_kroner(self.annual_expenses),
            format_kroner(self.year_end_balance),
        )
    }
}

/// Creates the budget period for a year, optionally copying the expenses of a template.
///
/// # Errors
///
/// - Returns a validation error if the owner already has a period for the year, if the year is
///   outside 2000 through 2100, or if `--from-template` does not name a template.
/// - Returns an error if the local store cannot be written.
pub async fn create_period(
    config: Config,
    mode: Mode,
    args: CreatePeriodArgs,
) -> Result<Out<BudgetPeriod>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let period = BudgetPeriod::new(config.owner_id(), args.year())
        .with_monthly_payment(args.monthly_payment())
        .with_previous_year_balance(args.previous_balance());
    let period = engine.create_period(period, args.from_template()).await?;
    engine.flush().await;
    Ok(Out::new(
        format!("Created budget period {} for {}", period.id(), period.year()),
        period,
    ))
}

pub async fn archive_period(config: Config, mode: Mode, args: IdArgs) -> Result<Out<()>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    engine.archive_period(args.id()).await?;
    engine.flush().await;
    Ok(format!("Archived budget period {}", args.id()).into())
}

pub async fn unarchive_period(config: Config, mode: Mode, args: IdArgs) -> Result<Out<()>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    engine.unarchive_period(args.id()).await?;
    engine.flush().await;
    Ok(format!("Budget period {} is active again", args.id()).into())
}

/// Lists the local budget periods and templates with their yearly totals. Reads the local store
/// only.
pub async fn list_periods(config: Config, mode: Mode) -> Result<Out<Vec<PeriodSummary>>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let periods = loaded(engine.load_budget_periods().await)?;
    let expenses = loaded(engine.load_expenses().await)?;

    let mut by_period: HashMap<&str, Vec<&Expense>> = HashMap::new();
    for expense in &expenses {
        by_period
            .entry(expense.period_id())
            .or_default()
            .push(expense);
    }
    let summaries: Vec<PeriodSummary> = periods
        .iter()
        .map(|p| {
            let expenses = by_period.get(p.id()).map(Vec::as_slice).unwrap_or_default();
            PeriodSummary::new(p, expenses)
        })
        .collect();

    if summaries.is_empty() {
        return Ok(Out::new("There are no budget periods", summaries));
    }
    let lines: Vec<String> = summaries.iter().map(PeriodSummary::line).collect();
    Ok(Out::new(
        format!(
            "{} budget period{}:\n{}",
            summaries.len(),
            plural(summaries.len()),
            lines.join("\n")
        ),
        summaries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::AddExpenseArgs;
    use crate::commands::add_expense;
    use crate::model::Frequency;
    use crate::test::TestEnv;

    #[tokio::test]
    async fn test_create_and_list_periods() {
        let env = TestEnv::new().await;
        let out = create_period(
            env.config(),
            Mode::Test,
            CreatePeriodArgs::new(2025, 10_000, 2_000),
        )
        .await
        .unwrap();
        let period = out.structure().unwrap().clone();
        assert_eq!(period.year(), 2025);

        add_expense(
            env.config(),
            Mode::Test,
            AddExpenseArgs::new(period.id(), "Rent", 7_500),
        )
        .await
        .unwrap();

        let out = list_periods(env.config(), Mode::Test).await.unwrap();
        let summaries = out.structure().unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.expense_count, 1);
        assert_eq!(summary.annual_payments, 120_000);
        assert_eq!(summary.annual_expenses, 90_000);
        assert_eq!(summary.year_end_balance, 32_000);
        assert!(out.message().contains("balance 32.000 kr."));
    }

    #[tokio::test]
    async fn test_create_period_rejects_duplicate_year() {
        let env = TestEnv::new().await;
        create_period(env.config(), Mode::Test, CreatePeriodArgs::new(2025, 0, 0))
            .await
            .unwrap();
        let err = create_period(env.config(), Mode::Test, CreatePeriodArgs::new(2025, 0, 0))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_archive_and_unarchive() {
        let env = TestEnv::new().await;
        let out = create_period(env.config(), Mode::Test, CreatePeriodArgs::new(2024, 0, 0))
            .await
            .unwrap();
        let id = out.structure().unwrap().id().to_string();

        archive_period(env.config(), Mode::Test, IdArgs::new(&id))
            .await
            .unwrap();
        let out = list_periods(env.config(), Mode::Test).await.unwrap();
        assert_eq!(out.structure().unwrap()[0].status, PeriodStatus::Archived);

        unarchive_period(env.config(), Mode::Test, IdArgs::new(&id))
            .await
            .unwrap();
        let out = list_periods(env.config(), Mode::Test).await.unwrap();
        assert_eq!(out.structure().unwrap()[0].status, PeriodStatus::Active);
    }

    #[test]
    fn test_summary_of_huge_amounts_saturates() {
        let period = BudgetPeriod::new("o", 2025).with_monthly_payment(i64::MAX / 4);
        let a = Expense::new("o", period.id(), "A", i64::MAX / 2, Frequency::Monthly);
        let b = Expense::new("o", period.id(), "B", i64::MAX / 2, Frequency::Monthly);
        let summary = PeriodSummary::new(&period, &[&a, &b]);
        assert_eq!(summary.annual_payments, i64::MAX);
        assert_eq!(summary.annual_expenses, i64::MAX);
        assert_eq!(summary.year_end_balance, 0);
        assert!(summary.line().contains("balance 0 kr."));
    }

    #[tokio::test]
    async fn test_list_empty() {
        let env = TestEnv::new().await;
        let out = list_periods(env.config(), Mode::Test).await.unwrap();
        assert_eq!(out.message(), "There are no budget periods");
    }
}
