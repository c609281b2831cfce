//! Configuration file handling.
//!
//! The configuration file is stored at `$BUDGET_HOME/config.json` and contains the owner of the
//! local data, the remote store endpoint, backup settings and the timing of the sync engine.

use crate::backup::Backup;
use crate::coordinator::CoordinatorSettings;
use crate::db::Db;
use crate::error::{ErrorType, IntoResult, Res};
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "budget";
const CONFIG_VERSION: u8 = 1;
const BACKUP_COPIES: u32 = 5;
const SECRETS: &str = ".secrets";
const BACKUPS: &str = ".backups";
const API_KEY: &str = "api_key";
const CONFIG_JSON: &str = "config.json";
const BUDGET_SQLITE: &str = "budget.sqlite";

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$BUDGET_HOME` and from there it loads `$BUDGET_HOME/config.json`. It provides
/// paths to other items that are either configurable or are expected in a certain location within
/// the budget home directory.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    backups: PathBuf,
    secrets: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    db: Db,
    sqlite_path: PathBuf,
}

impl Config {
    /// Creates the data directory, its subdirectories and:
    /// - Creates an initial `config.json` file for `owner_id` along with default settings
    /// - Moves `api_key_file`, if given, into its default location in the data dir
    /// - Creates and initializes the SQLite store
    ///
    /// # Arguments
    /// - `dir` - The directory that will be the root of data directory, e.g. `$HOME/budget`
    /// - `owner_id` - The id of the user who owns the budget data.
    /// - `remote_url` - The base URL of the remote store, e.g. `https://xyz.example.co`. Commands
    ///   that need the remote store fail until one is set in `config.json`, unless running in
    ///   test mode.
    /// - `api_key_file` - A file holding the API key of the remote store.
    ///
    /// # Errors
    /// - Returns an error if any file operations fail.
    pub async fn create(
        dir: impl Into<PathBuf>,
        owner_id: &str,
        remote_url: Option<&str>,
        api_key_file: Option<&Path>,
    ) -> Result<Self> {
        Self::create_inner(dir.into(), owner_id, remote_url, api_key_file)
            .await
            .pub_result(ErrorType::Config)
    }

    async fn create_inner(
        maybe_relative: PathBuf,
        owner_id: &str,
        remote_url: Option<&str>,
        api_key_file: Option<&Path>,
    ) -> Res<Self> {
        if owner_id.trim().is_empty() {
            bail!("An owner id is required");
        }
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the budget home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;
        let config_path = root.join(CONFIG_JSON);
        if config_path.exists() {
            bail!("{} is already initialized", root.display());
        }

        let backups_dir = root.join(BACKUPS);
        utils::make_dir(&backups_dir).await?;
        let secrets_dir = root.join(SECRETS);
        utils::make_dir(&secrets_dir).await?;

        if let Some(api_key_file) = api_key_file {
            utils::rename(api_key_file, secrets_dir.join(API_KEY)).await?;
        }

        let config_file = ConfigFile {
            owner_id: owner_id.trim().to_string(),
            remote_url: remote_url.map(str::to_string),
            ..ConfigFile::default()
        };
        config_file.save(&config_path).await?;

        let db_path = root.join(BUDGET_SQLITE);
        let db = Db::init(&db_path)
            .await
            .context("Unable to create SQLite DB")?;

        Ok(Self {
            root,
            backups: backups_dir,
            secrets: secrets_dir,
            config_path,
            config_file,
            db,
            sqlite_path: db_path,
        })
    }

    /// This will
    /// - validate that `budget_home` exists and that the config file exists
    /// - load the config file
    /// - validate that the backups and secrets directories exist
    /// - open the SQLite store, bringing its schema up to date
    pub async fn load(budget_home: impl Into<PathBuf>) -> Result<Self> {
        Self::load_inner(budget_home.into())
            .await
            .pub_result(ErrorType::Config)
    }

    async fn load_inner(maybe_relative: PathBuf) -> Res<Self> {
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("Budget Home is missing")?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            bail!("The config file is missing '{}'", config_path.display())
        }
        let config_file = ConfigFile::load(&config_path).await?;

        let db_path = root.join(BUDGET_SQLITE);
        let db = Db::load(&db_path)
            .await
            .context("Unable to load SQLite DB")?;

        let config = Self {
            root: root.clone(),
            backups: root.join(BACKUPS),
            secrets: root.join(SECRETS),
            config_path,
            config_file,
            db,
            sqlite_path: db_path,
        };
        if !config.backups.is_dir() {
            bail!(
                "The backups directory is missing '{}'",
                config.backups.display()
            )
        }
        if !config.secrets.is_dir() {
            bail!(
                "The secrets directory is missing '{}'",
                config.secrets.display()
            )
        }
        Ok(config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub fn backups(&self) -> &Path {
        &self.backups
    }

    pub fn secrets(&self) -> &Path {
        &self.secrets
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub fn owner_id(&self) -> &str {
        &self.config_file.owner_id
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.config_file.remote_url.as_deref()
    }

    pub fn backup_copies(&self) -> u32 {
        self.config_file.backup_copies
    }

    pub fn sync_settings(&self) -> &SyncSettings {
        &self.config_file.sync
    }

    /// Creates a new `Backup` instance for managing backup files.
    pub fn backup(&self) -> Backup {
        Backup::new(self)
    }

    /// Returns the stored `api_key_path` if it is absolute, otherwise resolves the relative path.
    pub fn api_key_path(&self) -> PathBuf {
        let p = self.config_file.api_key_path();
        if p.is_absolute() {
            return p;
        }
        self.root.join(p)
    }

    /// Reads the API key of the remote store.
    pub(crate) async fn api_key(&self) -> Res<String> {
        let path = self.api_key_path();
        let key = utils::read(&path)
            .await
            .context("The API key of the remote store is missing")?;
        let key = key.trim();
        if key.is_empty() {
            bail!("The API key file '{}' is empty", path.display());
        }
        Ok(key.to_string())
    }
}

/// Timing of the sync engine, all in milliseconds. Missing fields take their defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Quiet time after the last change before queued pushes run.
    pub debounce_ms: u64,
    /// Width of the time bucket used to recognize a repeated push.
    pub dedup_window_ms: u64,
    /// How long a processed push is remembered.
    pub processed_retention_ms: u64,
    /// Time budget for loading remote data at startup.
    pub init_timeout_ms: u64,
    /// How long the `error` status is shown before it falls back to `idle`.
    pub error_reset_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            dedup_window_ms: 1000,
            processed_retention_ms: 5000,
            init_timeout_ms: 10_000,
            error_reset_ms: 5000,
        }
    }
}

impl SyncSettings {
    pub fn coordinator(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            processed_retention: Duration::from_millis(self.processed_retention_ms),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn error_reset(&self) -> Duration {
        Duration::from_millis(self.error_reset_ms)
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "budget",
///   "config_version": 1,
///   "owner_id": "3f0c7a52-5d0e-4a3e-9d55-0c8f5e2a1b77",
///   "remote_url": "https://xyz.example.co",
///   "api_key_path": ".secrets/api_key",
///   "backup_copies": 5,
///   "sync": { "debounce_ms": 1000, "init_timeout_ms": 10000 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "budget"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// The user who owns the local data
    owner_id: String,

    /// Base URL of the remote store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_url: Option<String>,

    /// Path to the API key file (optional, relative to config.json or absolute)
    /// Defaults to $BUDGET_HOME/.secrets/api_key if not specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key_path: Option<PathBuf>,

    /// Number of backup copies to keep
    #[serde(default = "default_backup_copies")]
    backup_copies: u32,

    #[serde(default)]
    sync: SyncSettings,
}

fn default_backup_copies() -> u32 {
    BACKUP_COPIES
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            owner_id: String::new(),
            remote_url: None,
            api_key_path: None,
            backup_copies: BACKUP_COPIES,
            sync: SyncSettings::default(),
        }
    }
}

impl ConfigFile {
    /// Loads a ConfigFile from the specified path and checks `app_name` and `owner_id`.
    async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        let config: ConfigFile = utils::deserialize(path).await?;

        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );
        anyhow::ensure!(
            !config.owner_id.trim().is_empty(),
            "The config file at {} has no owner_id",
            path.display()
        );

        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    async fn save(&self, path: impl AsRef<Path>) -> Res<()> {
        let p = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(p, data)
            .await
            .context("Unable to write config file")
    }

    /// Gets the API key path.
    ///
    /// If the path is relative, it should be interpreted as relative to the config.json file.
    /// If None, defaults to $BUDGET_HOME/.secrets/api_key
    fn api_key_path(&self) -> PathBuf {
        self.api_key_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(SECRETS).join(API_KEY))
    }
}
