//! JSON backups of the local budget data, taken before anything overwrites it.

use crate::error::{ErrorType, IntoResult, Res};
use crate::model::BudgetData;
use crate::{utils, Config, Result};
use anyhow::Context;
use chrono::Local;
use std::path::{Path, PathBuf};

/// Prefix for backups taken before `sync down` replaces the local data.
pub const SYNC_DOWN: &str = "sync-down";

/// Prefix for backups taken before a restore replaces the local data.
pub const RESTORE: &str = "pre-restore";

/// Manages backup file creation and rotation.
///
/// The `Backup` struct is immutable and owns copies of the paths and settings it needs.
/// Create a new instance via `Config::backup()` or `Backup::new()`.
#[derive(Debug, Clone)]
pub struct Backup {
    backups_dir: PathBuf,
    backup_copies: u32,
}

impl Backup {
    /// Creates a new `Backup` instance from a `Config`.
    pub fn new(config: &Config) -> Self {
        Self {
            backups_dir: config.backups().to_path_buf(),
            backup_copies: config.backup_copies(),
        }
    }

    /// Saves `BudgetData` as a pretty-printed JSON backup file.
    ///
    /// The filename format is `{prefix}.YYYY-MM-DD-NNN.json` where NNN is a sequence number.
    /// Automatically rotates old backups, keeping only `backup_copies` files.
    ///
    /// Returns the path to the created backup file.
    pub async fn save_json(&self, prefix: &str, data: &BudgetData) -> Result<PathBuf> {
        self.save_json_inner(prefix, data)
            .await
            .pub_result(ErrorType::Backup)
    }

    /// Reads a JSON backup written by `save_json`.
    pub async fn load_json(path: &Path) -> Result<BudgetData> {
        utils::deserialize(path)
            .await
            .context("Unable to read the backup")
            .pub_result(ErrorType::Backup)
    }

    async fn save_json_inner(&self, prefix: &str, data: &BudgetData) -> Res<PathBuf> {
        let date = today();
        let seq = self.next_sequence_number(prefix, &date).await?;
        let filename = format!("{prefix}.{date}-{seq:03}.json");
        let path = self.backups_dir.join(&filename);

        let json =
            serde_json::to_string_pretty(data).context("Failed to serialize budget data to JSON")?;
        utils::write(&path, json).await?;

        self.rotate(prefix).await?;

        Ok(path)
    }

    /// Scans the backups directory for existing files with the given prefix and date,
    /// and returns the next sequence number.
    async fn next_sequence_number(&self, prefix: &str, date: &str) -> Res<u32> {
        let mut max_seq: u32 = 0;

        let mut dir = utils::read_dir(&self.backups_dir).await?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if let Some(seq) = parse_sequence_number(&name, prefix, date) {
                max_seq = max_seq.max(seq);
            }
        }

        Ok(max_seq + 1)
    }

    /// Rotates old backup files, keeping only `backup_copies` files with the given prefix.
    async fn rotate(&self, prefix: &str) -> Res<()> {
        let mut files: Vec<(PathBuf, String)> = Vec::new();

        let mut dir = utils::read_dir(&self.backups_dir).await?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_backup_file(&name, prefix) {
                files.push((entry.path(), name));
            }
        }

        // The name sorts by date, then sequence number.
        files.sort_by(|a, b| a.1.cmp(&b.1));

        let to_delete = files.len().saturating_sub(self.backup_copies as usize);
        for (path, _) in files.into_iter().take(to_delete) {
            utils::remove(&path).await?;
        }

        Ok(())
    }
}

/// Returns today's date in YYYY-MM-DD format.
fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Parses the sequence number from a backup filename of the form `{prefix}.{date}-{NNN}.json`.
/// Returns None if the filename doesn't match.
fn parse_sequence_number(filename: &str, prefix: &str, date: &str) -> Option<u32> {
    filename
        .strip_prefix(&format!("{prefix}.{date}-"))?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn is_backup_file(filename: &str, prefix: &str) -> bool {
    filename.starts_with(&format!("{prefix}.")) && filename.ends_with(".json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BudgetPeriod, Expense, Frequency};
    use tempfile::TempDir;

    fn backup(dir: &TempDir, copies: u32) -> Backup {
        Backup {
            backups_dir: dir.path().to_path_buf(),
            backup_copies: copies,
        }
    }

    #[test]
    fn test_parse_sequence_number() {
        assert_eq!(
            parse_sequence_number("sync-down.2025-12-14-001.json", "sync-down", "2025-12-14"),
            Some(1)
        );
        assert_eq!(
            parse_sequence_number("sync-down.2025-12-14-042.json", "sync-down", "2025-12-14"),
            Some(42)
        );
        // Wrong prefix
        assert_eq!(
            parse_sequence_number("pre-restore.2025-12-14-001.json", "sync-down", "2025-12-14"),
            None
        );
        // Wrong date
        assert_eq!(
            parse_sequence_number("sync-down.2025-12-13-001.json", "sync-down", "2025-12-14"),
            None
        );
    }

    #[test]
    fn test_is_backup_file() {
        assert!(is_backup_file("sync-down.2025-12-14-001.json", "sync-down"));
        assert!(is_backup_file("pre-restore.2025-12-14-001.json", "pre-restore"));
        assert!(!is_backup_file("sync-down.2025-12-14-001.json", "pre-restore"));
        assert!(!is_backup_file("sync-down.2025-12-14-001", "sync-down"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let period = BudgetPeriod::new("o", 2025);
        let expense = Expense::new("o", period.id(), "Rent", 100, Frequency::Monthly);
        let data = BudgetData::new(vec![period], vec![expense]);

        let path = backup(&dir, 5).save_json(SYNC_DOWN, &data).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("sync-down."));
        assert!(name.ends_with("-001.json"));
        assert_eq!(Backup::load_json(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = TempDir::new().unwrap();
        let b = backup(&dir, 2);
        let data = BudgetData::default();
        for _ in 0..4 {
            b.save_json(RESTORE, &data).await.unwrap();
        }
        b.save_json(SYNC_DOWN, &data).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with("-003.json"));
        assert!(names[1].ends_with("-004.json"));
        assert!(names[2].starts_with("sync-down."));
    }

    #[tokio::test]
    async fn test_load_missing_backup() {
        let dir = TempDir::new().unwrap();
        let err = Backup::load_json(&dir.path().join("x.json"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Backup);
    }
}
