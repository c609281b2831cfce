//! Types that represent the core data model, such as `BudgetPeriod` and `Expense`.
mod danish;
mod expense;
mod monthly;
mod period;

pub use danish::{format_danish_number, format_kroner, parse_danish_number};
pub use expense::{Expense, Frequency};
pub use monthly::MonthlyAmounts;
pub use period::{BudgetPeriod, PeriodStatus, TEMPLATE_YEAR};

use serde::{Deserialize, Serialize};

/// The largest amount in kroner that one amount, payment or balance may hold.
pub const MAX_AMOUNT: i64 = 1_000_000_000_000;

/// Both synchronized collections for one owner. This is what a pull returns, what a backup
/// contains, and what a restore writes back.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BudgetData {
    pub(crate) periods: Vec<BudgetPeriod>,
    pub(crate) expenses: Vec<Expense>,
}

impl BudgetData {
    pub fn new(periods: Vec<BudgetPeriod>, expenses: Vec<Expense>) -> Self {
        Self { periods, expenses }
    }

    pub fn periods(&self) -> &[BudgetPeriod] {
        &self.periods
    }

    pub fn expenses(&self) -> &[Expense] {
        &self.expenses
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty() && self.expenses.is_empty()
    }
}

/// Returns the current time formatted for storage.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Generates a new opaque identifier.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
