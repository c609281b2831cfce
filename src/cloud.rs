//! Reconciliation between the local store and the remote store.
//!
//! Expenses are pushed by whole-collection replace: every remote expense of the owner is
//! deleted and the local set is inserted. Periods and settings are few and edited one at a time,
//! so they are upserted by their natural key. Periods always reach the remote store before any
//! expense that references them.

use crate::db::{Db, LegacySettings};
use crate::error::Res;
use crate::model::{now_timestamp, BudgetData, BudgetPeriod, Expense};
use crate::remote::rows::{self, PERIOD_NATURAL_KEY, SETTINGS_KEY, TEMPLATE_KEY};
use crate::remote::{Collection, Filter, Remote};
use crate::status::StatusHandle;
use anyhow::Context;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The `sync_metadata` key holding the last successful sync time of `owner_id`.
pub(crate) fn last_sync_key(owner_id: &str) -> String {
    format!("last_sync:{owner_id}")
}

/// Pushes local collections to the remote store and pulls remote collections for one owner.
#[derive(Clone)]
pub struct CloudReconciler {
    db: Db,
    remote: Arc<dyn Remote>,
    owner_id: String,
    status: StatusHandle,
}

impl std::fmt::Debug for CloudReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudReconciler")
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

impl CloudReconciler {
    pub fn new(
        db: Db,
        remote: Arc<dyn Remote>,
        owner_id: impl Into<String>,
        status: StatusHandle,
    ) -> Self {
        Self {
            db,
            remote,
            owner_id: owner_id.into(),
            status,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Loads the persisted last sync time into the status object.
    pub async fn load_last_sync_time(&self) -> Res<()> {
        let time = self.db.get_metadata(&last_sync_key(&self.owner_id)).await?;
        self.status.restore_last_sync_time(time);
        Ok(())
    }

    /// Runs a push with the offline gate and status reporting around it.
    async fn tracked<F>(&self, what: &str, push: F) -> Res<()>
    where
        F: Future<Output = Res<()>>,
    {
        if !self.status.is_online() {
            debug!("Offline, skipping {what}");
            return Ok(());
        }
        self.status.set_syncing();
        match push.await {
            Ok(()) => {
                let now = now_timestamp();
                if let Err(e) = self
                    .db
                    .set_metadata(&last_sync_key(&self.owner_id), &now)
                    .await
                {
                    warn!("Unable to record the sync time: {e:#}");
                }
                self.status.set_synced(now);
                debug!("Finished {what}");
                Ok(())
            }
            Err(e) => {
                self.status.set_error(format!("{e:#}"));
                Err(e.context(format!("Failed to {what}")))
            }
        }
    }

    /// Replaces the owner's remote expenses with the local set. Parent periods the remote store
    /// does not know yet are pushed first.
    pub async fn push_expenses(&self) -> Res<()> {
        self.tracked("push expenses", self.push_expenses_inner())
            .await
    }

    /// Upserts every local period: regular periods by owner and year, templates by id.
    pub async fn push_periods(&self) -> Res<()> {
        self.tracked("push budget periods", async {
            let periods = self.db.list_periods(&self.owner_id).await?;
            self.upsert_periods(&periods).await
        })
        .await
    }

    /// Upserts the given periods only.
    pub async fn push_selected_periods(&self, periods: &[BudgetPeriod]) -> Res<()> {
        if periods.is_empty() {
            return Ok(());
        }
        self.tracked("push budget periods", self.upsert_periods(periods))
            .await
    }

    /// Pushes periods, then settings, then expenses.
    pub async fn push_all(&self) -> Res<()> {
        self.tracked("push all budget data", async {
            let periods = self.db.list_periods(&self.owner_id).await?;
            self.upsert_periods(&periods).await?;
            self.upsert_settings().await?;
            self.push_expenses_inner().await
        })
        .await
    }

    /// Upserts the owner's settings row, if there is one.
    pub async fn push_settings(&self) -> Res<()> {
        self.tracked("push settings", self.upsert_settings())
            .await
    }

    /// Deletes one period from the remote store. Its remote expenses go with it.
    pub async fn delete_period(&self, period_id: &str) -> Res<()> {
        self.tracked("delete a budget period", async {
            self.remote
                .delete(
                    Collection::BudgetPeriods,
                    &Filter::row(&self.owner_id, period_id),
                )
                .await
        })
        .await
    }

    /// Fetches both collections of the owner and maps them to local types. Nothing is written
    /// locally. Returns `None` when offline.
    pub async fn pull(&self) -> Res<Option<BudgetData>> {
        if !self.status.is_online() {
            debug!("Offline, skipping pull");
            return Ok(None);
        }
        let (periods, expenses) = tokio::join!(self.pull_periods(), self.pull_expenses());
        Ok(Some(BudgetData::new(periods?, expenses?)))
    }

    pub async fn pull_periods(&self) -> Res<Vec<BudgetPeriod>> {
        let remote_rows = self
            .remote
            .select(Collection::BudgetPeriods, &self.owner_id)
            .await
            .context("Failed to fetch budget periods")?;
        remote_rows.iter().map(rows::period_from_row).collect()
    }

    pub async fn pull_expenses(&self) -> Res<Vec<Expense>> {
        let remote_rows = self
            .remote
            .select(Collection::Expenses, &self.owner_id)
            .await
            .context("Failed to fetch expenses")?;
        let mut expenses = Vec::with_capacity(remote_rows.len());
        for row in &remote_rows {
            if let Some(expense) = rows::expense_from_row(row)? {
                expenses.push(expense);
            }
        }
        Ok(expenses)
    }

    pub async fn pull_settings(&self) -> Res<Option<LegacySettings>> {
        let remote_rows = self
            .remote
            .select(Collection::Settings, &self.owner_id)
            .await
            .context("Failed to fetch settings")?;
        remote_rows.first().map(rows::settings_from_row).transpose()
    }

    async fn push_expenses_inner(&self) -> Res<()> {
        let expenses = self.db.list_expenses(&self.owner_id).await?;
        self.ensure_remote_parents(&expenses).await?;

        let new_rows = expenses
            .iter()
            .map(rows::expense_to_row)
            .collect::<Res<Vec<_>>>()?;
        self.remote
            .delete(Collection::Expenses, &Filter::owner(&self.owner_id))
            .await?;
        if !new_rows.is_empty() {
            self.remote.insert(Collection::Expenses, &new_rows).await?;
        }
        info!("Replaced remote expenses with {} local row(s)", new_rows.len());
        Ok(())
    }

    /// Upserts the local periods that `expenses` reference but the remote store lacks.
    async fn ensure_remote_parents(&self, expenses: &[Expense]) -> Res<()> {
        let needed: HashSet<&str> = expenses.iter().map(|e| e.period_id()).collect();
        if needed.is_empty() {
            return Ok(());
        }
        let remote_ids: HashSet<String> = self
            .remote
            .select(Collection::BudgetPeriods, &self.owner_id)
            .await?
            .iter()
            .filter_map(|r| rows::text(r, rows::ID).map(str::to_string))
            .collect();
        let mut missing = Vec::new();
        for id in needed {
            if remote_ids.contains(id) {
                continue;
            }
            let period = self
                .db
                .get_period(id)
                .await?
                .with_context(|| {
                    format!("Expenses reference budget period {id}, which is missing")
                })?;
            missing.push(period);
        }
        if !missing.is_empty() {
            debug!(
                "Pushing {} budget period(s) before their expenses",
                missing.len()
            );
            self.upsert_periods(&missing).await?;
        }
        Ok(())
    }

    async fn upsert_settings(&self) -> Res<()> {
        let Some(settings) = self.db.get_settings(&self.owner_id).await? else {
            return Ok(());
        };
        let row = rows::settings_to_row(&settings)?;
        self.remote
            .upsert(Collection::Settings, &[row], SETTINGS_KEY)
            .await
    }

    async fn upsert_periods(&self, periods: &[BudgetPeriod]) -> Res<()> {
        let (templates, regular): (Vec<&BudgetPeriod>, Vec<&BudgetPeriod>) =
            periods.iter().partition(|p| p.is_template());
        if !regular.is_empty() {
            let period_rows = regular
                .into_iter()
                .map(rows::period_to_row)
                .collect::<Res<Vec<_>>>()?;
            self.remote
                .upsert(Collection::BudgetPeriods, &period_rows, PERIOD_NATURAL_KEY)
                .await?;
        }
        if !templates.is_empty() {
            let template_rows = templates
                .into_iter()
                .map(rows::period_to_row)
                .collect::<Res<Vec<_>>>()?;
            self.remote
                .upsert(Collection::BudgetPeriods, &template_rows, TEMPLATE_KEY)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::model::{Frequency, PeriodStatus};
    use crate::remote::{RemoteOp, TestRemote};
    use crate::status::SyncState;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Db, TestRemote, CloudReconciler) {
        let (dir, db) = test_db().await;
        let remote = TestRemote::default();
        let status = StatusHandle::new(Duration::from_secs(5));
        let cloud = CloudReconciler::new(db.clone(), Arc::new(remote.clone()), "o", status);
        (dir, db, remote, cloud)
    }

    #[tokio::test]
    async fn test_push_expenses_replaces_remote_collection() {
        let (_dir, db, remote, cloud) = setup().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        let rent = Expense::new("o", period.id(), "Rent", 5000, Frequency::Monthly);
        let car = Expense::new("o", period.id(), "Car", 900, Frequency::Quarterly);
        db.insert_expense(&rent).await.unwrap();
        db.insert_expense(&car).await.unwrap();
        cloud.push_all().await.unwrap();

        let mut edited = rent.clone();
        edited.amount = 5200;
        db.update_expense(&edited).await.unwrap();
        db.delete_expense("o", car.id()).await.unwrap();
        cloud.push_expenses().await.unwrap();

        let stored = remote.rows(Collection::Expenses).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["name"], "Rent");
        assert_eq!(stored[0]["amount"], 5200);

        let status = cloud.status().current();
        assert_eq!(status.status, SyncState::Synced);
        let persisted = db.get_metadata("last_sync:o").await.unwrap();
        assert_eq!(persisted, status.last_sync_time);
    }

    #[tokio::test]
    async fn test_push_expenses_pushes_missing_parents_first() {
        let (_dir, db, remote, cloud) = setup().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        db.insert_expense(&Expense::new("o", period.id(), "Rent", 1, Frequency::Monthly))
            .await
            .unwrap();

        cloud.push_expenses().await.unwrap();

        let ops: Vec<(RemoteOp, Collection)> = remote
            .calls()
            .await
            .into_iter()
            .map(|c| (c.op, c.collection))
            .collect();
        assert_eq!(
            ops,
            vec![
                (RemoteOp::Select, Collection::BudgetPeriods),
                (RemoteOp::Upsert, Collection::BudgetPeriods),
                (RemoteOp::Delete, Collection::Expenses),
                (RemoteOp::Insert, Collection::Expenses),
            ]
        );
        assert_eq!(remote.rows(Collection::BudgetPeriods).await.len(), 1);
    }

    #[tokio::test]
    async fn test_expenses_before_periods_is_rejected_by_remote() {
        let (_dir, _db, remote, _cloud) = setup().await;
        let expense = Expense::new("o", "unknown-period", "Rent", 1, Frequency::Monthly);
        let row = rows::expense_to_row(&expense).unwrap();
        let err = remote
            .insert(Collection::Expenses, &[row])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("foreign key"));
    }

    #[tokio::test]
    async fn test_templates_upsert_by_id() {
        let (_dir, db, remote, cloud) = setup().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        db.insert_period(&period.to_template("Lean", None))
            .await
            .unwrap();
        db.insert_period(&period.to_template("Fat", None))
            .await
            .unwrap();
        cloud.push_periods().await.unwrap();
        cloud.push_periods().await.unwrap();
        assert_eq!(remote.rows(Collection::BudgetPeriods).await.len(), 3);

        let mut archived = period.clone();
        archived.status = PeriodStatus::Archived;
        db.update_period(&archived).await.unwrap();
        cloud.push_periods().await.unwrap();
        let pulled = cloud.pull_periods().await.unwrap();
        let found = pulled.iter().find(|p| p.id() == period.id()).unwrap();
        assert_eq!(found.status(), PeriodStatus::Archived);
    }

    #[tokio::test]
    async fn test_offline_push_is_noop_success() {
        let (_dir, db, remote, cloud) = setup().await;
        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        cloud.status().set_online(false);
        cloud.push_all().await.unwrap();
        assert!(remote.calls().await.is_empty());
        assert_eq!(cloud.status().current().status, SyncState::Offline);
        assert!(cloud.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_sets_error() {
        let (_dir, db, remote, cloud) = setup().await;
        db.insert_period(&BudgetPeriod::new("o", 2025)).await.unwrap();
        remote.set_failing(true).await;
        let err = cloud.push_periods().await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to push budget periods"));
        let status = cloud.status().current();
        assert_eq!(status.status, SyncState::Error);
        assert!(status.last_error.is_some());
        // Local data is untouched by the failed sync.
        assert_eq!(db.list_periods("o").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_maps_remote_rows() {
        let (_dir, db, _remote, cloud) = setup().await;
        let period = BudgetPeriod::new("o", 2025).with_monthly_payment(3000);
        db.insert_period(&period).await.unwrap();
        db.insert_expense(&Expense::new("o", period.id(), "Rent", 1, Frequency::Yearly))
            .await
            .unwrap();
        cloud.push_all().await.unwrap();

        let data = cloud.pull().await.unwrap().unwrap();
        assert_eq!(data.periods(), &[period.clone()]);
        assert_eq!(data.expenses().len(), 1);
        let pulled = &data.expenses()[0];
        assert_eq!(pulled.period_id(), period.id());
        assert_eq!(pulled.frequency(), Frequency::Yearly);
        // Pulling never writes locally.
        assert_eq!(db.list_expenses("o").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settings_and_period_delete() {
        let (_dir, db, remote, cloud) = setup().await;
        cloud.push_settings().await.unwrap();
        assert!(remote.rows(Collection::Settings).await.is_empty());

        db.upsert_settings(&LegacySettings::new("o", 100, 5))
            .await
            .unwrap();
        cloud.push_settings().await.unwrap();
        cloud.push_settings().await.unwrap();
        assert_eq!(remote.rows(Collection::Settings).await.len(), 1);
        assert_eq!(
            cloud.pull_settings().await.unwrap().unwrap().monthly_payment(),
            100
        );

        let period = BudgetPeriod::new("o", 2025);
        db.insert_period(&period).await.unwrap();
        db.insert_expense(&Expense::new("o", period.id(), "Rent", 1, Frequency::Monthly))
            .await
            .unwrap();
        cloud.push_all().await.unwrap();
        let ops: Vec<(RemoteOp, Collection)> = remote
            .calls()
            .await
            .into_iter()
            .skip_while(|c| c.collection == Collection::Settings)
            .map(|c| (c.op, c.collection))
            .collect();
        assert_eq!(
            ops,
            vec![
                (RemoteOp::Upsert, Collection::BudgetPeriods),
                (RemoteOp::Upsert, Collection::Settings),
                (RemoteOp::Select, Collection::BudgetPeriods),
                (RemoteOp::Delete, Collection::Expenses),
                (RemoteOp::Insert, Collection::Expenses),
            ]
        );
        cloud.delete_period(period.id()).await.unwrap();
        assert!(remote.rows(Collection::BudgetPeriods).await.is_empty());
        assert!(remote.rows(Collection::Expenses).await.is_empty());
    }
}
