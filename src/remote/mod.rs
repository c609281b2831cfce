//! The remote store that budget data is mirrored to.
//!
//! The `Remote` trait is deliberately narrow: owner-scoped `select`, `upsert` on a conflict key,
//! `delete` by owner (and optionally id) and bulk `insert`. Rows are plain JSON objects using the
//! remote column names; `rows` converts them to and from the local model.

mod http;
pub(crate) mod rows;
mod test_remote;

use crate::error::Res;
use crate::Config;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub(crate) use http::HttpRemote;
pub use test_remote::{RemoteCall, RemoteOp, TestRemote};

/// The collections held by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    BudgetPeriods,
    Expenses,
    Settings,
}

serde_plain::derive_display_from_serialize!(Collection);

/// Selects rows of one owner, and optionally a single row of that owner by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub(crate) owner_id: String,
    pub(crate) id: Option<String>,
}

impl Filter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            id: None,
        }
    }

    pub fn row(owner_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            id: Some(id.into()),
        }
    }

    /// Returns `true` if the JSON object `row` is selected by this filter.
    pub(crate) fn matches(&self, row: &Value) -> bool {
        let owner_matches = row.get(rows::OWNER) == Some(&Value::String(self.owner_id.clone()));
        let id_matches = match &self.id {
            None => true,
            Some(id) => row.get(rows::ID) == Some(&Value::String(id.clone())),
        };
        owner_matches && id_matches
    }
}

/// The operations the sync engine needs from a remote store.
#[async_trait::async_trait]
pub trait Remote: Send + Sync {
    /// Returns every row of `collection` that belongs to `owner_id`.
    async fn select(&self, collection: Collection, owner_id: &str) -> Res<Vec<Value>>;

    /// Inserts `rows`, or updates the existing row when the columns named in `on_conflict`
    /// (comma-separated) match.
    async fn upsert(&self, collection: Collection, rows: &[Value], on_conflict: &str) -> Res<()>;

    /// Deletes every row selected by `filter`.
    async fn delete(&self, collection: Collection, filter: &Filter) -> Res<()>;

    /// Inserts `rows`. The remote store assigns ids to rows that do not carry one.
    async fn insert(&self, collection: Collection, rows: &[Value]) -> Res<()>;
}

/// Which `Remote` implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Talk to the configured REST endpoint.
    #[default]
    Http,
    /// Use an in-memory remote. Lets the whole program run without a server.
    Test,
}

const TEST_MODE_VAR: &str = "BUDGET_SYNC_IN_TEST_MODE";

impl Mode {
    /// `Mode::Test` when `BUDGET_SYNC_IN_TEST_MODE` is set and non-empty, otherwise `Mode::Http`.
    pub fn from_env() -> Self {
        match std::env::var(TEST_MODE_VAR) {
            Ok(v) if !v.is_empty() => Mode::Test,
            _ => Mode::Http,
        }
    }
}

/// Builds the remote store selected by `mode`.
pub(crate) async fn remote(config: &Config, mode: Mode) -> Res<Arc<dyn Remote>> {
    match mode {
        Mode::Test => Ok(Arc::new(TestRemote::default())),
        Mode::Http => {
            let url = config
                .remote_url()
                .context("No remote_url is configured, add one to config.json")?;
            let api_key = config.api_key().await?;
            Ok(Arc::new(HttpRemote::new(url, api_key)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::BudgetPeriods.to_string(), "budget_periods");
        assert_eq!(Collection::Expenses.to_string(), "expenses");
        assert_eq!(Collection::Settings.to_string(), "settings");
    }

    #[test]
    fn test_filter_matches() {
        let row = json!({"id": "a", "user_id": "o"});
        assert!(Filter::owner("o").matches(&row));
        assert!(Filter::row("o", "a").matches(&row));
        assert!(!Filter::row("o", "b").matches(&row));
        assert!(!Filter::owner("p").matches(&row));
    }
}
