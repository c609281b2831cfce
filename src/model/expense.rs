use crate::error::Res;
use crate::model::{new_id, now_timestamp, MonthlyAmounts, MAX_AMOUNT};
use anyhow::ensure;
use serde::{Deserialize, Serialize};

/// How often a fixed-amount expense is due.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

serde_plain::derive_display_from_serialize!(Frequency);
serde_plain::derive_fromstr_from_deserialize!(Frequency);

/// A single budgeted expense, owned by exactly one `BudgetPeriod`.
///
/// If `monthly_amounts` is present it overrides `amount` and `frequency` when computing totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Expense {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) period_id: String,
    pub(crate) name: String,
    pub(crate) amount: i64,
    pub(crate) frequency: Frequency,
    pub(crate) start_month: u8,
    pub(crate) end_month: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) monthly_amounts: Option<MonthlyAmounts>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl Expense {
    /// Creates a new expense covering the whole year with a fresh id.
    pub fn new(
        owner_id: impl Into<String>,
        period_id: impl Into<String>,
        name: impl Into<String>,
        amount: i64,
        frequency: Frequency,
    ) -> Self {
        let now = now_timestamp();
        Self {
            id: new_id(),
            owner_id: owner_id.into(),
            period_id: period_id.into(),
            name: name.into(),
            amount,
            frequency,
            start_month: 1,
            end_month: 12,
            monthly_amounts: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_months(mut self, start_month: u8, end_month: u8) -> Self {
        self.start_month = start_month;
        self.end_month = end_month;
        self
    }

    pub fn with_monthly_amounts(mut self, amounts: Option<MonthlyAmounts>) -> Self {
        self.monthly_amounts = amounts;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    /// A copy of this expense under `period_id`, with a fresh id.
    pub fn copy_to(&self, period_id: impl Into<String>) -> Self {
        let now = now_timestamp();
        Self {
            id: new_id(),
            period_id: period_id.into(),
            created_at: now.clone(),
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn start_month(&self) -> u8 {
        self.start_month
    }

    pub fn end_month(&self) -> u8 {
        self.end_month
    }

    pub fn monthly_amounts(&self) -> Option<&MonthlyAmounts> {
        self.monthly_amounts.as_ref()
    }

    /// Trims the name, clamps the months into 1..=12 and swaps them if they are reversed.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.start_month = self.start_month.clamp(1, 12);
        self.end_month = self.end_month.clamp(1, 12);
        if self.start_month > self.end_month {
            std::mem::swap(&mut self.start_month, &mut self.end_month);
        }
    }

    pub fn validate(&self) -> Res<()> {
        ensure!(!self.id.is_empty(), "An expense must have an id");
        ensure!(!self.owner_id.is_empty(), "An expense must have an owner");
        ensure!(
            !self.period_id.is_empty(),
            "An expense must belong to a budget period"
        );
        ensure!(!self.name.trim().is_empty(), "An expense must have a name");
        ensure!(
            (1..=12).contains(&self.start_month) && (1..=12).contains(&self.end_month),
            "Months must be between 1 and 12"
        );
        ensure!(
            self.start_month <= self.end_month,
            "The start month must not be after the end month"
        );
        match &self.monthly_amounts {
            Some(amounts) => {
                ensure!(
                    !amounts.any_negative(),
                    "Monthly amounts cannot be negative"
                );
                ensure!(
                    !amounts.any_above(MAX_AMOUNT),
                    "Monthly amounts cannot exceed {MAX_AMOUNT}"
                );
            }
            None => {
                ensure!(self.amount > 0, "The amount must be positive");
                ensure!(
                    self.amount <= MAX_AMOUNT,
                    "The amount cannot exceed {MAX_AMOUNT}"
                );
            }
        }
        Ok(())
    }

    /// The amount due in `month`, 1 through 12.
    pub fn amount_for_month(&self, month: u8) -> i64 {
        if let Some(amounts) = &self.monthly_amounts {
            return amounts.get(month);
        }
        if month < self.start_month || month > self.end_month {
            return 0;
        }
        match self.frequency {
            Frequency::Monthly => self.amount,
            Frequency::Quarterly if (month - self.start_month) % 3 == 0 => self.amount,
            Frequency::Yearly if month == self.start_month => self.amount,
            _ => 0,
        }
    }

    /// The sum over the twelve months, saturating at the bounds of `i64`.
    pub fn annual_total(&self) -> i64 {
        (1..=12).fold(0, |total: i64, m| total.saturating_add(self.amount_for_month(m)))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_timestamp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expense(frequency: Frequency) -> Expense {
        Expense::new("o", "p", "Rent", 100, frequency)
    }

    #[test]
    fn test_monthly_total() {
        assert_eq!(expense(Frequency::Monthly).annual_total(), 1200);
        let e = expense(Frequency::Monthly).with_months(3, 5);
        assert_eq!(e.annual_total(), 300);
        assert_eq!(e.amount_for_month(2), 0);
    }

    #[test]
    fn test_quarterly_total() {
        let e = expense(Frequency::Quarterly);
        assert_eq!(e.amount_for_month(1), 100);
        assert_eq!(e.amount_for_month(2), 0);
        assert_eq!(e.amount_for_month(4), 100);
        assert_eq!(e.annual_total(), 400);
        let e = expense(Frequency::Quarterly).with_months(2, 6);
        assert_eq!(e.annual_total(), 200);
    }

    #[test]
    fn test_yearly_total() {
        let e = expense(Frequency::Yearly).with_months(6, 12);
        assert_eq!(e.amount_for_month(6), 100);
        assert_eq!(e.annual_total(), 100);
    }

    #[test]
    fn test_monthly_amounts_override_frequency() {
        let e = expense(Frequency::Yearly)
            .with_months(6, 6)
            .with_monthly_amounts(Some(MonthlyAmounts::new([10; 12])));
        assert_eq!(e.amount_for_month(1), 10);
        assert_eq!(e.annual_total(), 120);
    }

    #[test]
    fn test_huge_amounts() {
        let e = Expense::new("o", "p", "Yacht", i64::MAX / 2, Frequency::Monthly);
        assert!(e.validate().is_err());
        assert_eq!(e.annual_total(), i64::MAX);
        let e = Expense::new("o", "p", "House", MAX_AMOUNT, Frequency::Monthly);
        assert!(e.validate().is_ok());
        let e = e.with_monthly_amounts(Some(MonthlyAmounts::new([MAX_AMOUNT + 1; 12])));
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_normalize_swaps_and_clamps() {
        let mut e = expense(Frequency::Monthly).with_months(11, 0);
        e.name = "  Rent ".to_string();
        e.normalize();
        assert_eq!(e.start_month(), 1);
        assert_eq!(e.end_month(), 11);
        assert_eq!(e.name(), "Rent");
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(expense(Frequency::Monthly).validate().is_ok());
        let mut e = expense(Frequency::Monthly);
        e.amount = 0;
        assert!(e.validate().is_err());
        // Variable expenses ignore the fixed amount.
        let e = e.with_monthly_amounts(Some(MonthlyAmounts::new([0; 12])));
        assert!(e.validate().is_ok());
        let e = expense(Frequency::Monthly).with_months(5, 2);
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_copy_to() {
        let e = expense(Frequency::Quarterly).with_months(2, 11);
        let copy = e.copy_to("q");
        assert_ne!(copy.id(), e.id());
        assert_eq!(copy.period_id(), "q");
        assert_eq!(copy.name(), "Rent");
        assert_eq!(copy.frequency(), Frequency::Quarterly);
        assert_eq!((copy.start_month(), copy.end_month()), (2, 11));
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(
            "quarterly".parse::<Frequency>().unwrap(),
            Frequency::Quarterly
        );
        assert_eq!(Frequency::Yearly.to_string(), "yearly");
        assert!("weekly".parse::<Frequency>().is_err());
    }
}
