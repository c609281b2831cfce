use crate::backup::SYNC_DOWN;
use crate::commands::{local_data, Out};
use crate::model::BudgetData;
use crate::{BudgetEngine, Config, Mode, Result};
use tracing::{debug, info};

/// Pushes all local budget periods and expenses to the remote store, periods first.
pub async fn sync_up(config: Config, mode: Mode) -> Result<Out<()>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    engine.sync_up().await?;
    let status = engine.status();
    Ok(format!(
        "Pushed all local data to the remote store at {}",
        status.last_sync_time.as_deref().unwrap_or("an unknown time")
    )
    .into())
}

/// Replaces the local data with the remote data. The local data is saved as a `sync-down` backup
/// first, so it can be brought back with `budget restore`.
pub async fn sync_down(config: Config, mode: Mode) -> Result<Out<BudgetData>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;

    let local = local_data(&engine).await?;
    let backup_path = config.backup().save_json(SYNC_DOWN, &local).await?;
    debug!("Saved backup of the local data to {}", backup_path.display());

    match engine.sync_down().await? {
        Some(data) => {
            info!("Local data saved to {}", backup_path.display());
            Ok(Out::new(
                format!(
                    "Pulled {} budget period(s) and {} expense(s) from the remote store",
                    data.periods().len(),
                    data.expenses().len()
                ),
                data,
            ))
        }
        None => Ok("Offline, the local data was left as it is".into()),
    }
}
