//! Expense command handlers.

use crate::args::{AddExpenseArgs, IdArgs, ListExpensesArgs, UpdateExpenseArgs};
use crate::commands::{loaded, plural, Out};
use crate::error::Error;
use crate::model::{format_kroner, Expense};
use crate::{BudgetEngine, Config, Mode, Result};

/// Adds an expense to a budget period.
///
/// # Errors
///
/// - Returns a validation error if the period does not exist, the amount is not positive or the
///   month range is invalid.
/// - Returns an error if the local store cannot be written.
pub async fn add_expense(config: Config, mode: Mode, args: AddExpenseArgs) -> Result<Out<Expense>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let expense = Expense::new(
        config.owner_id(),
        args.period(),
        args.name(),
        args.amount(),
        args.frequency(),
    )
    .with_months(args.start_month(), args.end_month());
    let expense = engine.add_expense(expense).await?;
    engine.flush().await;
    Ok(Out::new(
        format!(
            "Added expense {} ({}, {} {})",
            expense.id(),
            expense.name(),
            format_kroner(expense.amount()),
            expense.frequency()
        ),
        expense,
    ))
}

/// Changes the fields given in `args` and keeps the rest.
pub async fn update_expense(
    config: Config,
    mode: Mode,
    args: UpdateExpenseArgs,
) -> Result<Out<Expense>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let Some(mut expense) = engine.expense(args.id()).await? else {
        return Err(Error::validation(format!("There is no expense {}", args.id())));
    };
    if let Some(name) = args.name() {
        expense = expense.with_name(name);
    }
    if let Some(amount) = args.amount() {
        expense = expense.with_amount(amount);
    }
    if let Some(frequency) = args.frequency() {
        expense = expense.with_frequency(frequency);
    }
    if args.start_month().is_some() || args.end_month().is_some() {
        let start = args.start_month().unwrap_or(expense.start_month());
        let end = args.end_month().unwrap_or(expense.end_month());
        expense = expense.with_months(start, end);
    }
    let expense = engine.update_expense(expense).await?;
    engine.flush().await;
    Ok(Out::new(format!("Updated expense {}", expense.id()), expense))
}

pub async fn delete_expense(config: Config, mode: Mode, args: IdArgs) -> Result<Out<()>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let message = if engine.delete_expense(args.id()).await? {
        format!("Deleted expense {}", args.id())
    } else {
        format!("There was no expense {}", args.id())
    };
    Ok(message.into())
}

/// Lists the local expenses, optionally for one period.
pub async fn list_expenses(
    config: Config,
    mode: Mode,
    args: ListExpensesArgs,
) -> Result<Out<Vec<Expense>>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let expenses = match args.period() {
        Some(period_id) => engine.expenses_for_period(period_id).await?,
        None => loaded(engine.load_expenses().await)?,
    };
    let lines: Vec<String> = expenses
        .iter()
        .map(|e| {
            format!(
                "{}  {}: {} {}, months {}-{}, {} a year",
                e.id(),
                e.name(),
                format_kroner(e.amount()),
                e.frequency(),
                e.start_month(),
                e.end_month(),
                format_kroner(e.annual_total())
            )
        })
        .collect();
    let mut message = format!("{} expense{}", expenses.len(), plural(expenses.len()));
    if !lines.is_empty() {
        message = format!("{message}:\n{}", lines.join("\n"));
    }
    Ok(Out::new(message, expenses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::CreatePeriodArgs;
    use crate::commands::create_period;
    use crate::model::Frequency;
    use crate::test::TestEnv;

    async fn period(env: &TestEnv, year: i32) -> String {
        create_period(env.config(), Mode::Test, CreatePeriodArgs::new(year, 0, 0))
            .await
            .unwrap()
            .structure()
            .unwrap()
            .id()
            .to_string()
    }

    #[tokio::test]
    async fn test_add_update_delete() {
        let env = TestEnv::new().await;
        let period_id = period(&env, 2025).await;

        let out = add_expense(
            env.config(),
            Mode::Test,
            AddExpenseArgs::new(&period_id, "Insurance", 1_200),
        )
        .await
        .unwrap();
        let id = out.structure().unwrap().id().to_string();

        let out = update_expense(
            env.config(),
            Mode::Test,
            UpdateExpenseArgs::new(&id).with_amount(3_000),
        )
        .await
        .unwrap();
        let updated = out.structure().unwrap();
        assert_eq!(updated.amount(), 3_000);
        assert_eq!(updated.name(), "Insurance");
        assert_eq!(updated.frequency(), Frequency::Monthly);

        let out = delete_expense(env.config(), Mode::Test, IdArgs::new(&id))
            .await
            .unwrap();
        assert_eq!(out.message(), format!("Deleted expense {id}"));
        let out = delete_expense(env.config(), Mode::Test, IdArgs::new(&id))
            .await
            .unwrap();
        assert!(out.message().starts_with("There was no expense"));
    }

    #[tokio::test]
    async fn test_add_to_missing_period_is_rejected() {
        let env = TestEnv::new().await;
        let err = add_expense(
            env.config(),
            Mode::Test,
            AddExpenseArgs::new("nope", "Rent", 100),
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_update_missing_expense_is_rejected() {
        let env = TestEnv::new().await;
        let err = update_expense(
            env.config(),
            Mode::Test,
            UpdateExpenseArgs::new("nope").with_name("x"),
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_list_by_period() {
        let env = TestEnv::new().await;
        let first = period(&env, 2025).await;
        let second = period(&env, 2026).await;
        for (period_id, name) in [(&first, "Rent"), (&first, "Power"), (&second, "Rent")] {
            add_expense(
                env.config(),
                Mode::Test,
                AddExpenseArgs::new(period_id, name, 100),
            )
            .await
            .unwrap();
        }

        let out = list_expenses(env.config(), Mode::Test, ListExpensesArgs::default())
            .await
            .unwrap();
        assert_eq!(out.structure().unwrap().len(), 3);

        let out = list_expenses(
            env.config(),
            Mode::Test,
            ListExpensesArgs::new(Some(second.clone())),
        )
        .await
        .unwrap();
        assert_eq!(out.structure().unwrap().len(), 1);
        assert!(out.message().starts_with("1 expense:"));
    }
}
