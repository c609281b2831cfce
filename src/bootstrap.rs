//! The one-time startup sequence that resolves local data against the remote store.
//!
//! Both remote collections are fetched in parallel under a single time budget. A fetch that
//! fails degrades to "unknown" rather than aborting its sibling, and a timeout leaves the local
//! data in place. Writes to either store wait for the coordinator's single-flight lock, so they
//! never interleave with a push. Whatever happens, the returned state is marked initialized so
//! the application never waits forever.

use crate::cloud::CloudReconciler;
use crate::coordinator::Coordinator;
use crate::db::{Db, LegacyMigration};
use crate::error::Res;
use crate::model::{BudgetData, BudgetPeriod, Expense};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The first consistent view of the owner's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitialState {
    pub periods: Vec<BudgetPeriod>,
    pub expenses: Vec<Expense>,
    /// Always `true` once `Bootstrapper::run` returns.
    pub initialized: bool,
    pub timed_out: bool,
    /// A user-visible message if the remote store could not be reconciled.
    pub error: Option<String>,
}

impl InitialState {
    fn local(data: BudgetData, timed_out: bool, error: Option<String>) -> Self {
        Self {
            periods: data.periods,
            expenses: data.expenses,
            initialized: true,
            timed_out,
            error,
        }
    }
}

/// What the parallel fetch produced. A `None` collection failed to load.
struct Fetched {
    periods: Option<Vec<BudgetPeriod>>,
    expenses: Option<Vec<Expense>>,
    errors: Vec<String>,
}

/// Runs the startup sequence for one owner.
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    db: Db,
    cloud: CloudReconciler,
    coordinator: Coordinator,
    timeout: Duration,
}

impl Bootstrapper {
    pub fn new(
        db: Db,
        cloud: CloudReconciler,
        coordinator: Coordinator,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            cloud,
            coordinator,
            timeout,
        }
    }

    /// - Moves legacy expenses into a period
    /// - Fetches remote periods and expenses in parallel, bounded by the timeout
    /// - Pushes local periods the remote store does not know
    /// - Commits the resolved data to the local store in one transaction
    /// - Pushes local expenses if the remote store had none
    ///
    /// Only local storage failures are returned as errors.
    pub async fn run(&self) -> Res<InitialState> {
        let owner_id = self.cloud.owner_id().to_string();
        if let LegacyMigration::Migrated { expenses, .. } =
            self.db.migrate_legacy_data(&owner_id).await?
        {
            info!("Attached {expenses} legacy expense(s) to a budget period");
        }
        self.cloud.load_last_sync_time().await?;
        let local = self.db.load_budget_data(&owner_id).await?;

        if !self.cloud.status().is_online() {
            debug!("Offline, starting from local data");
            return Ok(InitialState::local(local, false, None));
        }

        let cloud = self.cloud.clone();
        // The fetch keeps running if the timeout wins; its result is dropped.
        let fetch = tokio::spawn(async move { fetch(&cloud).await });
        let fetched = match tokio::time::timeout(self.timeout, fetch).await {
            Err(_) => {
                let message = format!(
                    "Loading from the cloud took longer than {}s, showing local data",
                    self.timeout.as_secs_f64()
                );
                warn!("{message}");
                self.cloud.status().set_error(message.clone());
                return Ok(InitialState::local(local, true, Some(message)));
            }
            Ok(Err(e)) => {
                let message = format!("Loading from the cloud failed: {e}");
                warn!("{message}");
                self.cloud.status().set_error(message.clone());
                return Ok(InitialState::local(local, false, Some(message)));
            }
            Ok(Ok(fetched)) => fetched,
        };

        self.resolve(&owner_id, fetched).await
    }

    async fn resolve(&self, owner_id: &str, fetched: Fetched) -> Res<InitialState> {
        let _lock = self.coordinator.acquire().await;
        // Edits made while waiting for the lock are part of the local side.
        let local = self.db.load_budget_data(owner_id).await?;
        let mut errors = fetched.errors;
        let (periods, unknown, remap) =
            merge_periods(local.periods, fetched.periods.as_deref().unwrap_or_default());

        // Parents first: periods the remote store lacks go up before anything references them.
        // With the remote periods unknown, an upsert by year could clobber a remote period.
        if fetched.periods.is_some() && !unknown.is_empty() {
            debug!("Pushing {} local budget period(s) to the cloud", unknown.len());
            if let Err(e) = self.cloud.push_selected_periods(&unknown).await {
                errors.push(format!("{e:#}"));
            }
        }

        let period_ids: HashSet<&str> = periods.iter().map(|p| p.id()).collect();
        let fetched_both = fetched.periods.is_some() && fetched.expenses.is_some();
        let remote_expenses = match (&fetched.periods, fetched.expenses) {
            (Some(_), Some(expenses)) if !expenses.is_empty() => Some(expenses),
            _ => None,
        };
        let adopt_remote = remote_expenses.is_some();
        let expenses: Vec<Expense> = match remote_expenses {
            Some(expenses) => expenses
                .into_iter()
                .filter(|e| period_ids.contains(e.period_id()))
                .collect(),
            None => local
                .expenses
                .into_iter()
                .map(|mut e| {
                    if let Some(new_id) = remap.get(&e.period_id) {
                        e.period_id = new_id.clone();
                    }
                    e
                })
                .filter(|e| period_ids.contains(e.period_id()))
                .collect(),
        };

        let data = BudgetData::new(periods, expenses);
        self.db.replace_budget_data(owner_id, &data).await?;

        // The remote store had no expenses, so the local ones become the remote set. This only
        // happens when both fetches succeeded.
        let remote_had_none = fetched_both && !adopt_remote;
        if remote_had_none && !data.expenses.is_empty() {
            if let Err(e) = self.cloud.push_expenses().await {
                errors.push(format!("{e:#}"));
            }
        }

        let error = if errors.is_empty() {
            None
        } else {
            let message = errors.join("; ");
            self.cloud.status().set_error(message.clone());
            Some(message)
        };
        info!(
            "Initialized with {} budget period(s) and {} expense(s)",
            data.periods.len(),
            data.expenses.len()
        );
        Ok(InitialState::local(data, false, error))
    }
}

async fn fetch(cloud: &CloudReconciler) -> Fetched {
    let (periods, expenses) = tokio::join!(cloud.pull_periods(), cloud.pull_expenses());
    let mut errors = Vec::new();
    let periods = periods
        .map_err(|e| {
            warn!("Unable to fetch budget periods: {e:#}");
            errors.push(format!("{e:#}"));
        })
        .ok();
    let expenses = expenses
        .map_err(|e| {
            warn!("Unable to fetch expenses: {e:#}");
            errors.push(format!("{e:#}"));
        })
        .ok();
    Fetched {
        periods,
        expenses,
        errors,
    }
}

/// Merges local periods with the remote ones. Remote rows win for ids both sides know. A local
/// period whose year the remote store holds under another id takes the remote id. Returns the
/// merged periods, the local periods the remote store does not know, and the id remapping.
fn merge_periods(
    local: Vec<BudgetPeriod>,
    remote: &[BudgetPeriod],
) -> (Vec<BudgetPeriod>, Vec<BudgetPeriod>, HashMap<String, String>) {
    let remote_ids: HashSet<&str> = remote.iter().map(|p| p.id()).collect();
    let remote_years: HashMap<i32, &str> = remote
        .iter()
        .filter(|p| !p.is_template())
        .map(|p| (p.year(), p.id()))
        .collect();

    let mut merged: Vec<BudgetPeriod> = remote.to_vec();
    let mut unknown = Vec::new();
    let mut remap = HashMap::new();
    for period in local {
        if remote_ids.contains(period.id()) {
            continue;
        }
        if !period.is_template() {
            if let Some(remote_id) = remote_years.get(&period.year()) {
                debug!(
                    "Local budget period {} for {} is {} in the cloud",
                    period.id(),
                    period.year(),
                    remote_id
                );
                remap.insert(period.id.clone(), remote_id.to_string());
                continue;
            }
        }
        unknown.push(period.clone());
        merged.push(period);
    }
    (merged, unknown, remap)
}
