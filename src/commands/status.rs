use crate::commands::Out;
use crate::status::{SyncState, SyncStatus};
use crate::{BudgetEngine, Config, Mode, Result};
use serde::Serialize;

/// What `budget status` reports after the startup sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub sync: SyncStatus,
    pub periods: usize,
    pub expenses: usize,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the startup sequence: the one-time migration of legacy data, then a reconciliation of the
/// local data with the remote store. Reports the resulting data counts and sync status.
///
/// Remote failures and timeouts do not fail the command, they are part of the report.
pub async fn status(config: Config, mode: Mode) -> Result<Out<StatusReport>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let state = engine.init().await?;
    engine.flush().await;

    let report = StatusReport {
        sync: engine.status(),
        periods: state.periods.len(),
        expenses: state.expenses.len(),
        timed_out: state.timed_out,
        error: state.error.clone(),
    };
    let mut message = format!(
        "{} budget period(s) and {} expense(s), sync status: {}",
        report.periods, report.expenses, report.sync.status
    );
    if let Some(time) = &report.sync.last_sync_time {
        message = format!("{message}, last synced {time}");
    }
    if let Some(error) = &report.error {
        message = format!("{message}\n{error}");
    } else if report.sync.status == SyncState::Error {
        if let Some(error) = &report.sync.last_error {
            message = format!("{message}\n{error}");
        }
    }
    Ok(Out::new(message, report))
}
