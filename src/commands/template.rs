//! Template command handlers.

use crate::args::{IdArgs, SaveTemplateArgs};
use crate::commands::Out;
use crate::model::BudgetPeriod;
use crate::{BudgetEngine, Config, Mode, Result};

/// Saves a budget period and its expenses as a named template.
pub async fn save_template(
    config: Config,
    mode: Mode,
    args: SaveTemplateArgs,
) -> Result<Out<BudgetPeriod>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let template = engine
        .save_as_template(
            args.period_id(),
            args.name(),
            args.description().map(str::to_string),
        )
        .await?;
    engine.flush().await;
    Ok(Out::new(
        format!("Saved template '{}' as {}", args.name().trim(), template.id()),
        template,
    ))
}

/// Deletes a template locally and then from the remote store.
pub async fn delete_template(config: Config, mode: Mode, args: IdArgs) -> Result<Out<()>> {
    let engine = BudgetEngine::from_config(&config, mode).await?;
    let message = if engine.delete_template(args.id()).await? {
        format!("Deleted template {}", args.id())
    } else {
        format!("There was no template {}", args.id())
    };
    Ok(message.into())
}
