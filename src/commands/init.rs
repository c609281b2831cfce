use crate::args::InitArgs;
use crate::commands::Out;
use crate::{Config, Result};
use std::path::Path;

/// Creates the data directory, its subdirectories and:
/// - Creates an initial `config.json` file for the owner along with default settings
/// - Moves the API key file, if given, into its default location in the data dir
/// - Creates the local SQLite store
///
/// # Arguments
/// - `budget_home` - The directory that will be the root of data directory, e.g. `$HOME/budget`
/// - `args` - The owner id, remote store URL and API key file.
///
/// # Errors
/// - Returns an error if any file operations fail.
pub async fn init(budget_home: &Path, args: &InitArgs) -> Result<Out<()>> {
    let config = Config::create(
        budget_home,
        args.owner_id(),
        args.remote_url(),
        args.api_key(),
    )
    .await?;
    Ok(format!(
        "Successfully created the budget directory at {}, run 'budget status' to load remote data",
        config.root().display()
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_home() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("budget");
        let out = init(&home, &InitArgs::new("o", None, None)).await.unwrap();
        assert!(out.message().starts_with("Successfully created"));
        let config = Config::load(&home).await.unwrap();
        assert_eq!(config.owner_id(), "o");

        // A second init refuses to overwrite the store.
        assert!(init(&home, &InitArgs::new("o", None, None)).await.is_err());
    }
}
