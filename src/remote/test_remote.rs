//! Implements the `Remote` trait in memory for testing purposes.
//!
//! Note: this is compiled even in the "production" version of this app so that we can run the whole
//! app, top-to-bottom, without a server.

use crate::error::Res;
use crate::remote::rows::{self, ID, OWNER, PERIOD};
use crate::remote::{Collection, Filter, Remote};
use anyhow::{bail, Context};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// The kind of call made against a `TestRemote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Select,
    Upsert,
    Delete,
    Insert,
}

/// One recorded call against a `TestRemote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub collection: Collection,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<Collection, Vec<Value>>,
    calls: Vec<RemoteCall>,
    failing: bool,
    failing_collections: HashSet<Collection>,
    delay: Option<Duration>,
}

impl State {
    fn table(&mut self, collection: Collection) -> &mut Vec<Value> {
        self.tables.entry(collection).or_default()
    }

    fn period_exists(&self, id: &str) -> bool {
        self.tables
            .get(&Collection::BudgetPeriods)
            .map(|t| t.iter().any(|r| rows::text(r, ID) == Some(id)))
            .unwrap_or(false)
    }

    /// Rejects expense rows whose parent period is not stored, the way a foreign key would.
    fn check_foreign_keys(&self, collection: Collection, new_rows: &[Value]) -> Res<()> {
        if collection != Collection::Expenses {
            return Ok(());
        }
        for row in new_rows {
            if let Some(period_id) = rows::text(row, PERIOD) {
                if !self.period_exists(period_id) {
                    bail!(
                        "insert or update on table \"expenses\" violates foreign key constraint \
                         \"expenses_budget_period_id_fkey\": budget period {period_id} does not exist"
                    );
                }
            }
        }
        Ok(())
    }
}

/// An in-memory `Remote`. Clones share the same data, so a test can keep one handle for
/// inspection while the engine uses another.
#[derive(Debug, Clone, Default)]
pub struct TestRemote {
    state: Arc<Mutex<State>>,
}

impl TestRemote {
    /// Makes every following call fail (or succeed again).
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Makes every following call on `collection` fail (or succeed again).
    pub async fn set_failing_collection(&self, collection: Collection, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing_collections.insert(collection);
        } else {
            state.failing_collections.remove(&collection);
        }
    }

    /// Makes every following call sleep for `delay` before doing anything.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.delay = delay;
    }

    /// The rows currently stored in `collection`, in insertion order.
    pub async fn rows(&self, collection: Collection) -> Vec<Value> {
        self.state
            .lock()
            .await
            .tables
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the content of `collection` without any checks.
    pub async fn set_rows(&self, collection: Collection, rows: Vec<Value>) {
        self.state.lock().await.tables.insert(collection, rows);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Records the call, then applies the configured delay and failure.
    async fn begin(&self, op: RemoteOp, collection: Collection) -> Res<()> {
        trace!("{op:?} on {collection}");
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(RemoteCall { op, collection });
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().await;
        if state.failing || state.failing_collections.contains(&collection) {
            bail!("The test remote is set to fail ({op:?} on {collection})");
        }
        Ok(())
    }
}

fn object(row: &Value) -> Res<&serde_json::Map<String, Value>> {
    row.as_object()
        .with_context(|| format!("Expected a JSON object row, got {row}"))
}

/// Gives a row an id if it does not carry one.
fn with_id(row: &Value) -> Res<Value> {
    let mut map = object(row)?.clone();
    let has_id = matches!(map.get(ID), Some(Value::String(s)) if !s.is_empty());
    if !has_id {
        map.insert(ID.to_string(), Value::String(crate::model::new_id()));
    }
    Ok(Value::Object(map))
}

fn same_key(a: &Value, b: &Value, columns: &[&str]) -> bool {
    columns.iter().all(|c| a.get(*c).is_some() && a.get(*c) == b.get(*c))
}

#[async_trait::async_trait]
impl Remote for TestRemote {
    async fn select(&self, collection: Collection, owner_id: &str) -> Res<Vec<Value>> {
        self.begin(RemoteOp::Select, collection).await?;
        let filter = Filter::owner(owner_id);
        let mut state = self.state.lock().await;
        Ok(state
            .table(collection)
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn upsert(&self, collection: Collection, rows: &[Value], on_conflict: &str) -> Res<()> {
        self.begin(RemoteOp::Upsert, collection).await?;
        let columns: Vec<&str> = on_conflict.split(',').map(str::trim).collect();
        let mut state = self.state.lock().await;
        state.check_foreign_keys(collection, rows)?;
        for row in rows {
            let incoming = object(row)?;
            let table = state.table(collection);
            match table.iter_mut().find(|existing| same_key(existing, row, &columns)) {
                Some(existing) => {
                    if let Some(target) = existing.as_object_mut() {
                        for (k, v) in incoming {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                }
                None => table.push(with_id(row)?),
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, filter: &Filter) -> Res<()> {
        self.begin(RemoteOp::Delete, collection).await?;
        let mut state = self.state.lock().await;
        let table = state.table(collection);
        let removed: Vec<String> = table
            .iter()
            .filter(|r| filter.matches(r))
            .filter_map(|r| rows::text(r, ID).map(str::to_string))
            .collect();
        table.retain(|r| !filter.matches(r));

        if collection == Collection::BudgetPeriods && !removed.is_empty() {
            state.table(Collection::Expenses).retain(|r| match rows::text(r, PERIOD) {
                Some(period_id) => !removed.iter().any(|id| id == period_id),
                None => true,
            });
        }
        Ok(())
    }

    async fn insert(&self, collection: Collection, rows: &[Value]) -> Res<()> {
        self.begin(RemoteOp::Insert, collection).await?;
        let mut state = self.state.lock().await;
        state.check_foreign_keys(collection, rows)?;
        for row in rows {
            if object(row)?.get(OWNER).is_none() {
                bail!("A row for {collection} has no {OWNER}");
            }
        }
        let new_rows = rows.iter().map(with_id).collect::<Res<Vec<_>>>()?;
        state.table(collection).extend(new_rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_expense_requires_period() {
        let remote = TestRemote::default();
        let expense = json!({"user_id": "o", "budget_period_id": "p1", "name": "Rent"});
        let err = remote
            .insert(Collection::Expenses, &[expense.clone()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("foreign key"));

        let period = json!({"id": "p1", "user_id": "o", "year": 2025});
        remote
            .upsert(Collection::BudgetPeriods, &[period], "user_id,year")
            .await
            .unwrap();
        remote.insert(Collection::Expenses, &[expense]).await.unwrap();
        let stored = remote.rows(Collection::Expenses).await;
        assert_eq!(stored.len(), 1);
        assert!(rows::text(&stored[0], ID).is_some());
    }

    #[tokio::test]
    async fn test_upsert_by_natural_key() {
        let remote = TestRemote::default();
        let a = json!({"id": "a", "user_id": "o", "year": 2025, "monthly_payment": 1});
        let b = json!({"id": "a", "user_id": "o", "year": 2025, "monthly_payment": 2});
        let c = json!({"id": "c", "user_id": "o", "year": 2026, "monthly_payment": 3});
        remote
            .upsert(Collection::BudgetPeriods, &[a], "user_id,year")
            .await
            .unwrap();
        remote
            .upsert(Collection::BudgetPeriods, &[b, c], "user_id,year")
            .await
            .unwrap();
        let stored = remote.rows(Collection::BudgetPeriods).await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0]["monthly_payment"], 2);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_owner_scoped() {
        let remote = TestRemote::default();
        remote
            .set_rows(
                Collection::BudgetPeriods,
                vec![
                    json!({"id": "p1", "user_id": "o", "year": 2025}),
                    json!({"id": "p2", "user_id": "x", "year": 2025}),
                ],
            )
            .await;
        remote
            .set_rows(
                Collection::Expenses,
                vec![
                    json!({"id": "e1", "user_id": "o", "budget_period_id": "p1"}),
                    json!({"id": "e2", "user_id": "x", "budget_period_id": "p2"}),
                ],
            )
            .await;
        remote
            .delete(Collection::BudgetPeriods, &Filter::row("o", "p1"))
            .await
            .unwrap();
        assert_eq!(remote.rows(Collection::BudgetPeriods).await.len(), 1);
        let expenses = remote.rows(Collection::Expenses).await;
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0]["id"], "e2");
    }

    #[tokio::test]
    async fn test_failing_records_call() {
        let remote = TestRemote::default();
        remote.set_failing(true).await;
        assert!(remote.select(Collection::Expenses, "o").await.is_err());
        assert_eq!(
            remote.calls().await,
            vec![RemoteCall {
                op: RemoteOp::Select,
                collection: Collection::Expenses
            }]
        );
    }

    #[tokio::test]
    async fn test_failing_collection_leaves_others_alone() {
        let remote = TestRemote::default();
        remote
            .set_failing_collection(Collection::BudgetPeriods, true)
            .await;
        assert!(remote.select(Collection::BudgetPeriods, "o").await.is_err());
        assert!(remote.select(Collection::Expenses, "o").await.is_ok());

        remote
            .set_failing_collection(Collection::BudgetPeriods, false)
            .await;
        assert!(remote.select(Collection::BudgetPeriods, "o").await.is_ok());
    }
}
