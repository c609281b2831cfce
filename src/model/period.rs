use crate::error::Res;
use crate::model::{new_id, now_timestamp, MonthlyAmounts, MAX_AMOUNT};
use anyhow::{bail, ensure};
use serde::{Deserialize, Serialize};

/// Templates are exempt from year uniqueness and all carry this year.
pub const TEMPLATE_YEAR: i32 = 9999;

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2100;

/// Lifecycle status of a budget period.
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
pub enum PeriodStatus {
    #[default]
    Active,
    Archived,
}

serde_plain::derive_display_from_serialize!(PeriodStatus);
serde_plain::derive_fromstr_from_deserialize!(PeriodStatus);

/// A year-scoped (or template) container for expenses and the payment configuration.
///
/// When `monthly_payments` is present the period is in "variable mode" and those twelve amounts
/// are authoritative; otherwise `monthly_payment` applies to every month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BudgetPeriod {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) year: i32,
    pub(crate) monthly_payment: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) monthly_payments: Option<MonthlyAmounts>,
    pub(crate) previous_year_balance: i64,
    pub(crate) status: PeriodStatus,
    #[serde(default)]
    pub(crate) is_template: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) template_description: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl BudgetPeriod {
    /// Creates a new active period for `year` with a fresh id.
    pub fn new(owner_id: impl Into<String>, year: i32) -> Self {
        let now = now_timestamp();
        Self {
            id: new_id(),
            owner_id: owner_id.into(),
            year,
            monthly_payment: 0,
            monthly_payments: None,
            previous_year_balance: 0,
            status: PeriodStatus::Active,
            is_template: false,
            template_name: None,
            template_description: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Creates a template from this period. The template copies the payment configuration but
    /// gets its own id and the sentinel year.
    pub fn to_template(&self, name: impl Into<String>, description: Option<String>) -> Self {
        let mut template = Self::new(self.owner_id.clone(), TEMPLATE_YEAR);
        template.monthly_payment = self.monthly_payment;
        template.monthly_payments = self.monthly_payments;
        template.is_template = true;
        template.template_name = Some(name.into());
        template.template_description = description;
        template
    }

    pub fn with_monthly_payment(mut self, amount: i64) -> Self {
        self.monthly_payment = amount;
        self
    }

    pub fn with_monthly_payments(mut self, amounts: Option<MonthlyAmounts>) -> Self {
        self.monthly_payments = amounts;
        self
    }

    pub fn with_previous_year_balance(mut self, balance: i64) -> Self {
        self.previous_year_balance = balance;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn status(&self) -> PeriodStatus {
        self.status
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    pub fn template_name(&self) -> Option<&str> {
        self.template_name.as_deref()
    }

    pub fn monthly_payment(&self) -> i64 {
        self.monthly_payment
    }

    pub fn monthly_payments(&self) -> Option<&MonthlyAmounts> {
        self.monthly_payments.as_ref()
    }

    pub fn previous_year_balance(&self) -> i64 {
        self.previous_year_balance
    }

    pub fn is_variable(&self) -> bool {
        self.monthly_payments.is_some()
    }

    /// The payment for `month`, honoring variable mode.
    pub fn payment_for_month(&self, month: u8) -> i64 {
        match &self.monthly_payments {
            Some(amounts) => amounts.get(month),
            None if (1..=12).contains(&month) => self.monthly_payment,
            None => 0,
        }
    }

    /// The sum over the twelve months, saturating at the bounds of `i64`.
    pub fn annual_payments(&self) -> i64 {
        (1..=12).fold(0, |total: i64, m| total.saturating_add(self.payment_for_month(m)))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_timestamp();
    }

    /// Checks the field constraints of a period. Uniqueness of `(owner, year)` needs the store and
    /// is checked there.
    pub fn validate(&self) -> Res<()> {
        ensure!(!self.id.is_empty(), "A budget period must have an id");
        ensure!(!self.owner_id.is_empty(), "A budget period must have an owner");
        if self.is_template {
            ensure!(
                self.year == TEMPLATE_YEAR,
                "A template must use year {TEMPLATE_YEAR}, found {}",
                self.year
            );
            match self.template_name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => {}
                _ => bail!("A template must have a name"),
            }
        } else {
            ensure!(
                (MIN_YEAR..=MAX_YEAR).contains(&self.year),
                "The year must be between {MIN_YEAR} and {MAX_YEAR}, found {}",
                self.year
            );
        }
        ensure!(
            (0..=MAX_AMOUNT).contains(&self.monthly_payment),
            "The monthly payment must be between 0 and {MAX_AMOUNT}"
        );
        ensure!(
            (-MAX_AMOUNT..=MAX_AMOUNT).contains(&self.previous_year_balance),
            "The previous year's balance must be between -{MAX_AMOUNT} and {MAX_AMOUNT}"
        );
        if let Some(amounts) = &self.monthly_payments {
            ensure!(
                !amounts.any_negative(),
                "Monthly payments cannot be negative"
            );
            ensure!(
                !amounts.any_above(MAX_AMOUNT),
                "Monthly payments cannot exceed {MAX_AMOUNT}"
            );
        }
        Ok(())
    }
}
