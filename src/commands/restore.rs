use crate::args::RestoreArgs;
use crate::backup::{Backup, RESTORE};
use crate::commands::{local_data, Out};
use crate::model::BudgetData;
use crate::{BudgetEngine, Config, Mode, Result};
use tracing::info;

/// Replaces the local data with the contents of a JSON backup and pushes it to the remote store.
///
/// The current local data is saved as a `pre-restore` backup before anything is replaced.
///
/// # Errors
///
/// - Returns a `Backup` error if the file cannot be read.
/// - Returns a validation error if the backup belongs to another owner or is inconsistent.
/// - Returns a `Remote` error if the push fails. The local data has been restored at that point.
pub async fn restore(config: Config, mode: Mode, args: RestoreArgs) -> Result<Out<BudgetData>> {
    let data = Backup::load_json(args.backup_file()).await?;
    let engine = BudgetEngine::from_config(&config, mode).await?;

    let current = local_data(&engine).await?;
    let saved = config.backup().save_json(RESTORE, &current).await?;
    info!("Saved the current local data to {}", saved.display());

    engine.restore(data.clone()).await?;
    Ok(Out::new(
        format!(
            "Restored {} budget period(s) and {} expense(s) from {}",
            data.periods().len(),
            data.expenses().len(),
            args.backup_file().display()
        ),
        data,
    ))
}
