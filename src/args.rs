//! These structs provide the CLI interface for the budget CLI.

use crate::model::{parse_danish_number, Frequency};
use clap::{Parser, Subcommand};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing::level_filters::LevelFilter;

/// budget: A local-first budgeting tool.
///
/// Budget periods (one per year) and their expenses are kept in a local SQLite store, so every
/// command works offline. Changes are pushed to the configured remote store in the background
/// and can be pulled on another device with `budget sync down`.
///
/// Amounts are whole kroner and may be written the Danish way, e.g. 12.500.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the data directory, the configuration file and the local store.
    ///
    /// This is the first command you should run. Decide what directory you want to store data in
    /// and pass this as --budget-home. By default, it will be $HOME/budget.
    Init(InitArgs),
    /// Create, archive, unarchive or list budget periods.
    #[command(subcommand)]
    Period(PeriodCommand),
    /// Save a budget period as a template, or delete a template.
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Add, update, delete or list expenses.
    #[command(subcommand)]
    Expense(ExpenseCommand),
    /// Push all local data to the remote store, or replace the local data with the remote data.
    Sync(SyncArgs),
    /// Load the remote data at startup and show the sync status.
    Status,
    /// Replace the local data with a backup file and push it to the remote store.
    Restore(RestoreArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where budget data and configuration is held. Defaults to ~/budget
    #[arg(long, env = "BUDGET_HOME", default_value_t = default_budget_home())]
    budget_home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, budget_home: PathBuf) -> Self {
        Self {
            log_level,
            budget_home: budget_home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn budget_home(&self) -> &DisplayPath {
        &self.budget_home
    }
}

/// (Not shown): Args for the `budget init` command.
#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// The id of the user who owns the budget data in the remote store.
    #[arg(long)]
    owner_id: String,

    /// The base URL of the remote store.
    #[arg(long)]
    remote_url: Option<String>,

    /// A file holding the API key of the remote store. It will be moved to the default secrets
    /// location in the data directory.
    #[arg(long)]
    api_key: Option<PathBuf>,
}

impl InitArgs {
    pub fn new(
        owner_id: impl Into<String>,
        remote_url: Option<String>,
        api_key: Option<PathBuf>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            remote_url,
            api_key,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    pub fn api_key(&self) -> Option<&Path> {
        self.api_key.as_deref()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum PeriodCommand {
    /// Create the budget period for a year.
    Create(CreatePeriodArgs),
    /// Archive a budget period.
    Archive(IdArgs),
    /// Make an archived budget period active again.
    Unarchive(IdArgs),
    /// List budget periods and templates with their yearly totals.
    List,
}

/// (Not shown): Args for the `budget period create` command.
#[derive(Debug, Parser, Clone)]
pub struct CreatePeriodArgs {
    /// The calendar year, 2000 through 2100.
    #[arg(long)]
    year: i32,

    /// The fixed monthly payment.
    #[arg(long, default_value = "0", value_parser = parse_kroner)]
    monthly_payment: i64,

    /// The balance carried over from the previous year. May be negative.
    #[arg(long, default_value = "0", value_parser = parse_kroner, allow_hyphen_values = true)]
    previous_balance: i64,

    /// Copy the expenses of this template into the new period.
    #[arg(long)]
    from_template: Option<String>,
}

impl CreatePeriodArgs {
    pub fn new(year: i32, monthly_payment: i64, previous_balance: i64) -> Self {
        Self {
            year,
            monthly_payment,
            previous_balance,
            from_template: None,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.from_template = Some(template_id.into());
        self
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn monthly_payment(&self) -> i64 {
        self.monthly_payment
    }

    pub fn previous_balance(&self) -> i64 {
        self.previous_balance
    }

    pub fn from_template(&self) -> Option<&str> {
        self.from_template.as_deref()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum TemplateCommand {
    /// Save a budget period and its expenses as a template.
    Save(SaveTemplateArgs),
    /// Delete a template and its expenses, locally and remotely.
    Delete(IdArgs),
}

/// (Not shown): Args for the `budget template save` command.
#[derive(Debug, Parser, Clone)]
pub struct SaveTemplateArgs {
    /// The budget period to copy.
    period_id: String,

    /// The name of the template.
    #[arg(long)]
    name: String,

    /// An optional description.
    #[arg(long)]
    description: Option<String>,
}

impl SaveTemplateArgs {
    pub fn new(period_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            period_id: period_id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ExpenseCommand {
    /// Add an expense to a budget period.
    Add(AddExpenseArgs),
    /// Change fields of an expense. Fields that are not given keep their value.
    Update(UpdateExpenseArgs),
    /// Delete an expense.
    Delete(IdArgs),
    /// List expenses, optionally for one budget period only.
    List(ListExpensesArgs),
}

/// (Not shown): Args for the `budget expense add` command.
#[derive(Debug, Parser, Clone)]
pub struct AddExpenseArgs {
    /// The budget period the expense belongs to.
    #[arg(long)]
    period: String,

    #[arg(long)]
    name: String,

    /// The amount due each time the expense falls due.
    #[arg(long, value_parser = parse_kroner)]
    amount: i64,

    #[arg(long, default_value_t = Frequency::Monthly)]
    frequency: Frequency,

    /// The first month, 1 through 12.
    #[arg(long, default_value_t = 1)]
    start_month: u8,

    /// The last month, 1 through 12.
    #[arg(long, default_value_t = 12)]
    end_month: u8,
}

impl AddExpenseArgs {
    pub fn new(period: impl Into<String>, name: impl Into<String>, amount: i64) -> Self {
        Self {
            period: period.into(),
            name: name.into(),
            amount,
            frequency: Frequency::Monthly,
            start_month: 1,
            end_month: 12,
        }
    }

    pub fn period(&self) -> &str {
        &self.period
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
}

/// (Not shown): Args for the `budget expense update` command.
#[derive(Debug, Parser, Clone, Default)]
pub struct UpdateExpenseArgs {
    /// The expense to change.
    id: String,

    #[arg(long)]
    name: Option<String>,

    #[arg(long, value_parser = parse_kroner)]
    amount: Option<i64>,

    #[arg(long)]
    frequency: Option<Frequency>,

    #[arg(long)]
    start_month: Option<u8>,

    #[arg(long)]
    end_month: Option<u8>,
}

impl UpdateExpenseArgs {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount
    }

    pub fn frequency(&self) -> Option<Frequency> {
        self.frequency
    }

    pub fn start_month(&self) -> Option<u8> {
        self.start_month
    }

    pub fn end_month(&self) -> Option<u8> {
        self.end_month
    }
}

/// (Not shown): Args for the `budget expense list` command.
#[derive(Debug, Parser, Clone, Default)]
pub struct ListExpensesArgs {
    /// Only list the expenses of this budget period.
    #[arg(long)]
    period: Option<String>,
}

impl ListExpensesArgs {
    pub fn new(period: Option<String>) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Option<&str> {
        self.period.as_deref()
    }
}

/// (Not shown): Args for commands that take the id of one record.
#[derive(Debug, Parser, Clone)]
pub struct IdArgs {
    id: String,
}

impl IdArgs {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpDown {
    Up,
    #[default]
    Down,
}

serde_plain::derive_display_from_serialize!(UpDown);
serde_plain::derive_fromstr_from_deserialize!(UpDown);

/// (Not shown): Args for the `budget sync` command.
#[derive(Debug, Parser, Clone)]
pub struct SyncArgs {
    /// The direction to sync: "up" or "down"
    direction: UpDown,
}

impl SyncArgs {
    pub fn new(direction: UpDown) -> Self {
        Self { direction }
    }

    pub fn direction(&self) -> UpDown {
        self.direction
    }
}

/// (Not shown): Args for the `budget restore` command.
#[derive(Debug, Parser, Clone)]
pub struct RestoreArgs {
    /// A JSON backup, e.g. one from $BUDGET_HOME/.backups
    backup_file: PathBuf,
}

impl RestoreArgs {
    pub fn new(backup_file: impl Into<PathBuf>) -> Self {
        Self {
            backup_file: backup_file.into(),
        }
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }
}

/// Parses a whole number of kroner, accepting Danish thousands separators.
fn parse_kroner(s: &str) -> Result<i64, String> {
    let value = parse_danish_number(s).map_err(|e| e.to_string())?;
    if !value.fract().is_zero() {
        return Err(format!("'{s}' must be a whole number of kroner"));
    }
    value
        .to_i64()
        .ok_or_else(|| format!("'{s}' is too large"))
}

fn default_budget_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("budget"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --budget-home or BUDGET_HOME instead of relying on the default \
                budget home directory. If you continue using the program right now, you may have \
                problems!",
            );
            PathBuf::from("budget")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}
