//! Command handlers for the budget CLI.
//!
//! Every handler writes to the local store through a `BudgetEngine` and flushes the engine before
//! returning, so that debounced pushes finish before the process exits.

mod expense;
mod init;
mod period;
mod restore;
mod status;
mod sync;
mod template;

use crate::engine::LoadResult;
use crate::error::{Error, ErrorType};
use crate::model::BudgetData;
use crate::{BudgetEngine, Result};
use anyhow::anyhow;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

pub use expense::{add_expense, delete_expense, list_expenses, update_expense};
pub use init::init;
pub use period::{archive_period, create_period, list_periods, unarchive_period, PeriodSummary};
pub use restore::restore;
pub use status::{status, StatusReport};
pub use sync::{sync_down, sync_up};
pub use template::{delete_template, save_template};

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as JSON to `debug!`.
    pub fn print(&self) {
        info!("{}", self.message);
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// Turns a failed `LoadResult` into a storage error.
fn loaded<T>(result: LoadResult<T>) -> Result<T> {
    if result.success {
        return Ok(result.data);
    }
    Err(Error::new(
        ErrorType::Storage,
        anyhow!(result.error.unwrap_or_else(|| "Load failed".to_string())),
    ))
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Reads the owner's local data, e.g. to back it up before it is replaced.
async fn local_data(engine: &BudgetEngine) -> Result<BudgetData> {
    let periods = loaded(engine.load_budget_periods().await)?;
    let expenses = loaded(engine.load_expenses().await)?;
    Ok(BudgetData::new(periods, expenses))
}
