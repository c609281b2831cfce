//! The application-facing sync engine.
//!
//! Every mutation is written to the local store first and returns as soon as that write has
//! succeeded. The matching push is then handed to the coordinator: debounced for edits, immediate
//! for deletes and restores. A failed push never rolls back the local write; it only shows up in
//! the sync status.

use crate::bootstrap::{Bootstrapper, InitialState};
use crate::cloud::CloudReconciler;
use crate::config::SyncSettings;
use crate::coordinator::{op, Coordinator, EnqueueOutcome};
use crate::db::{is_unique_violation, Db};
use crate::error::{Error, ErrorType, IntoResult, Res};
use crate::model::{BudgetData, BudgetPeriod, Expense, PeriodStatus};
use crate::remote::{self, Mode, Remote};
use crate::status::{StatusHandle, SyncStatus};
use crate::{Config, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PUSH_EXPENSES: &str = "push_expenses";
const PUSH_PERIODS: &str = "push_periods";

/// The outcome of a load. A failed load carries empty data and the error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Default> LoadResult<T> {
    fn from_res(res: Res<T>) -> Self {
        match res {
            Ok(data) => Self {
                success: true,
                data,
                error: None,
            },
            Err(e) => {
                warn!("Load failed: {e:#}");
                Self {
                    success: false,
                    data: T::default(),
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }
}

/// Local-first access to one owner's budget data, with the remote mirror kept up to date in the
/// background.
#[derive(Debug, Clone)]
pub struct BudgetEngine {
    db: Db,
    cloud: CloudReconciler,
    coordinator: Coordinator,
    owner_id: String,
    init_timeout: Duration,
}

impl BudgetEngine {
    pub fn new(
        db: Db,
        remote: Arc<dyn Remote>,
        owner_id: impl Into<String>,
        settings: &SyncSettings,
    ) -> Self {
        let owner_id = owner_id.into();
        let status = StatusHandle::new(settings.error_reset());
        Self {
            cloud: CloudReconciler::new(db.clone(), remote, owner_id.clone(), status),
            coordinator: Coordinator::new(settings.coordinator()),
            db,
            owner_id,
            init_timeout: settings.init_timeout(),
        }
    }

    /// Builds the engine for the configured owner, talking to the remote store chosen by `mode`.
    pub async fn from_config(config: &Config, mode: Mode) -> Result<Self> {
        let remote = remote::remote(config, mode)
            .await
            .pub_result(ErrorType::Config)?;
        Ok(Self::new(
            config.db().clone(),
            remote,
            config.owner_id(),
            config.sync_settings(),
        ))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn status(&self) -> SyncStatus {
        self.cloud.status().current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.cloud.status().subscribe()
    }

    /// Applies the network signal. Pushes skipped while offline are not replayed; the next
    /// mutation pushes the then-current local state.
    pub fn set_online(&self, online: bool) {
        info!("Network is {}", if online { "online" } else { "offline" });
        self.cloud.status().set_online(online);
    }

    /// Runs the startup sequence. Only a local storage failure is an error; remote trouble and
    /// timeouts are reported inside the returned state.
    pub async fn init(&self) -> Result<InitialState> {
        Bootstrapper::new(
            self.db.clone(),
            self.cloud.clone(),
            self.coordinator.clone(),
            self.init_timeout,
        )
        .run()
        .await
        .pub_result(ErrorType::Storage)
    }

    pub async fn load_expenses(&self) -> LoadResult<Vec<Expense>> {
        LoadResult::from_res(self.db.list_expenses(&self.owner_id).await)
    }

    pub async fn load_budget_periods(&self) -> LoadResult<Vec<BudgetPeriod>> {
        LoadResult::from_res(self.db.list_periods(&self.owner_id).await)
    }

    pub async fn period(&self, id: &str) -> Result<Option<BudgetPeriod>> {
        let period = self.db.get_period(id).await.pub_result(ErrorType::Storage)?;
        Ok(period.filter(|p| p.owner_id() == self.owner_id))
    }

    pub async fn expense(&self, id: &str) -> Result<Option<Expense>> {
        let expense = self.db.get_expense(id).await.pub_result(ErrorType::Storage)?;
        Ok(expense.filter(|e| e.owner_id() == self.owner_id))
    }

    pub async fn expenses_for_period(&self, period_id: &str) -> Result<Vec<Expense>> {
        self.owned_period(period_id).await?;
        self.db
            .expenses_for_period(period_id)
            .await
            .pub_result(ErrorType::Storage)
    }

    /// Adds an expense to an existing period and schedules a push of the expenses.
    pub async fn add_expense(&self, mut expense: Expense) -> Result<Expense> {
        self.check_expense(&mut expense).await?;
        self.db
            .insert_expense(&expense)
            .await
            .pub_result(ErrorType::Storage)?;
        debug!("Added expense {} ({})", expense.id(), expense.name());
        self.schedule(PUSH_EXPENSES, |cloud| async move { cloud.push_expenses().await });
        Ok(expense)
    }

    /// Overwrites an existing expense and schedules a push of the expenses.
    pub async fn update_expense(&self, mut expense: Expense) -> Result<Expense> {
        if self.expense(expense.id()).await?.is_none() {
            return Err(Error::validation(format!("There is no expense {}", expense.id())));
        }
        self.check_expense(&mut expense).await?;
        expense.touch();
        self.db
            .update_expense(&expense)
            .await
            .pub_result(ErrorType::Storage)?;
        debug!("Updated expense {}", expense.id());
        self.schedule(PUSH_EXPENSES, |cloud| async move { cloud.push_expenses().await });
        Ok(expense)
    }

    /// Deletes an expense and pushes the expenses right away. Returns `false` if there was no
    /// such expense. A failed push is returned as a `Remote` error; the local delete stands.
    pub async fn delete_expense(&self, id: &str) -> Result<bool> {
        let deleted = self
            .db
            .delete_expense(&self.owner_id, id)
            .await
            .pub_result(ErrorType::Storage)?;
        if !deleted {
            return Ok(false);
        }
        debug!("Deleted expense {id}");
        self.immediate(|cloud| async move { cloud.push_expenses().await })
            .await?;
        Ok(true)
    }

    /// Creates a budget period. A second period for the same year is rejected before anything is
    /// written. With `template_id`, the template's expenses are copied into the new period.
    pub async fn create_period(
        &self,
        period: BudgetPeriod,
        template_id: Option<&str>,
    ) -> Result<BudgetPeriod> {
        self.check_owner(period.owner_id())?;
        if period.is_template() {
            return Err(Error::validation(
                "Templates are created by saving a budget period as a template",
            ));
        }
        period
            .validate()
            .pub_result(ErrorType::Validation)?;
        self.check_year_is_free(&period).await?;

        let expenses = match template_id {
            Some(template_id) => {
                let template = self.owned_period(template_id).await?;
                if !template.is_template() {
                    return Err(Error::validation(format!(
                        "Budget period {template_id} is not a template"
                    )));
                }
                self.db
                    .expenses_for_period(template_id)
                    .await
                    .pub_result(ErrorType::Storage)?
                    .iter()
                    .map(|e| e.copy_to(period.id()))
                    .collect()
            }
            None => Vec::new(),
        };

        self.db
            .insert_period_with_expenses(&period, &expenses)
            .await
            .map_err(|e| self.classify_insert(e, &period))?;
        info!("Created budget period {} for {}", period.id(), period.year());

        self.schedule(PUSH_PERIODS, |cloud| async move { cloud.push_periods().await });
        if !expenses.is_empty() {
            self.schedule(PUSH_EXPENSES, |cloud| async move { cloud.push_expenses().await });
        }
        Ok(period)
    }

    /// Saves payment or balance edits to a period and schedules a push of the periods.
    pub async fn update_period(&self, mut period: BudgetPeriod) -> Result<BudgetPeriod> {
        let existing = self.owned_period(period.id()).await?;
        if existing.is_template() != period.is_template() {
            return Err(Error::validation(
                "A budget period cannot be turned into a template or back",
            ));
        }
        self.check_owner(period.owner_id())?;
        period
            .validate()
            .pub_result(ErrorType::Validation)?;
        if existing.year() != period.year() {
            self.check_year_is_free(&period).await?;
        }
        period.touch();
        self.db
            .update_period(&period)
            .await
            .map_err(|e| self.classify_insert(e, &period))?;
        debug!("Updated budget period {}", period.id());
        self.schedule(PUSH_PERIODS, |cloud| async move { cloud.push_periods().await });
        Ok(period)
    }

    pub async fn archive_period(&self, id: &str) -> Result<()> {
        self.set_period_status(id, PeriodStatus::Archived).await
    }

    pub async fn unarchive_period(&self, id: &str) -> Result<()> {
        self.set_period_status(id, PeriodStatus::Active).await
    }

    /// Copies a period and its expenses into a new template and schedules a push.
    pub async fn save_as_template(
        &self,
        period_id: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<BudgetPeriod> {
        let source = self.owned_period(period_id).await?;
        if source.is_template() {
            return Err(Error::validation(format!(
                "Budget period {period_id} is already a template"
            )));
        }
        let template = source.to_template(name.trim(), description);
        template
            .validate()
            .pub_result(ErrorType::Validation)?;
        let expenses: Vec<Expense> = self
            .db
            .expenses_for_period(period_id)
            .await
            .pub_result(ErrorType::Storage)?
            .iter()
            .map(|e| e.copy_to(template.id()))
            .collect();
        self.db
            .insert_period_with_expenses(&template, &expenses)
            .await
            .pub_result(ErrorType::Storage)?;
        info!(
            "Saved budget period {period_id} as template '{}' with {} expense(s)",
            name.trim(),
            expenses.len()
        );

        self.schedule(PUSH_PERIODS, |cloud| async move { cloud.push_periods().await });
        if !expenses.is_empty() {
            self.schedule(PUSH_EXPENSES, |cloud| async move { cloud.push_expenses().await });
        }
        Ok(template)
    }

    /// Deletes a template and its expenses, then deletes it from the remote store right away.
    /// Returns `false` if there was no such template.
    pub async fn delete_template(&self, id: &str) -> Result<bool> {
        let Some(template) = self.period(id).await? else {
            return Ok(false);
        };
        if !template.is_template() {
            return Err(Error::validation(format!(
                "Budget period {id} is not a template, only templates can be deleted"
            )));
        }
        self.db
            .delete_period(id)
            .await
            .pub_result(ErrorType::Storage)?;
        info!("Deleted template {id}");
        let id = id.to_string();
        self.immediate(move |cloud| async move { cloud.delete_period(&id).await })
            .await?;
        Ok(true)
    }

    /// Replaces the owner's local data with `data`, typically read from a backup, and pushes it
    /// right away, periods before expenses.
    pub async fn restore(&self, data: BudgetData) -> Result<()> {
        self.check_restore(&data)?;
        self.db
            .replace_budget_data(&self.owner_id, &data)
            .await
            .pub_result(ErrorType::Storage)?;
        info!(
            "Restored {} budget period(s) and {} expense(s)",
            data.periods().len(),
            data.expenses().len()
        );
        self.immediate(|cloud| async move { cloud.push_all().await })
            .await
    }

    /// Pushes all local data now: periods, then settings, then expenses.
    pub async fn sync_up(&self) -> Result<()> {
        self.immediate(|cloud| async move { cloud.push_all().await })
            .await
    }

    /// Replaces the local data with the remote data and adopts the remote settings row if there
    /// is one. Returns `None` and leaves the local data alone when offline. Expenses whose period
    /// the remote store lacks are dropped.
    pub async fn sync_down(&self) -> Result<Option<BudgetData>> {
        let _lock = self.coordinator.acquire().await;
        let Some(pulled) = self.cloud.pull().await.pub_result(ErrorType::Remote)? else {
            return Ok(None);
        };
        let settings = self
            .cloud
            .pull_settings()
            .await
            .pub_result(ErrorType::Remote)?;
        let period_ids: HashSet<&str> = pulled.periods().iter().map(|p| p.id()).collect();
        let expenses: Vec<Expense> = pulled
            .expenses()
            .iter()
            .filter(|e| period_ids.contains(e.period_id()))
            .cloned()
            .collect();
        let dropped = pulled.expenses().len() - expenses.len();
        if dropped > 0 {
            warn!("Dropped {dropped} remote expense(s) without a budget period");
        }
        let data = BudgetData::new(pulled.periods().to_vec(), expenses);
        self.db
            .replace_budget_data(&self.owner_id, &data)
            .await
            .pub_result(ErrorType::Storage)?;
        if let Some(settings) = settings {
            self.db
                .upsert_settings(&settings)
                .await
                .pub_result(ErrorType::Storage)?;
        }
        info!(
            "Pulled {} budget period(s) and {} expense(s)",
            data.periods().len(),
            data.expenses().len()
        );
        Ok(Some(data))
    }

    /// Runs every queued push now and waits for them.
    pub async fn flush(&self) {
        self.coordinator.flush().await;
    }

    /// Drops queued pushes and cancels their timers.
    pub fn close(&self) {
        self.coordinator.clear_queue();
    }

    fn schedule<F, Fut>(&self, key: &str, f: F)
    where
        F: FnOnce(CloudReconciler) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Res<()>> + Send + 'static,
    {
        let cloud = self.cloud.clone();
        if self.coordinator.enqueue(key, op(move || f(cloud))) == EnqueueOutcome::Skipped {
            debug!("A {key} ran moments ago, the next change will push again");
        }
    }

    async fn immediate<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(CloudReconciler) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Res<()>> + Send + 'static,
    {
        let cloud = self.cloud.clone();
        self.coordinator
            .run_immediate(op(move || f(cloud)))
            .await
            .pub_result(ErrorType::Remote)
    }

    async fn set_period_status(&self, id: &str, status: PeriodStatus) -> Result<()> {
        let period = self.owned_period(id).await?;
        if period.is_template() {
            return Err(Error::validation("Templates cannot be archived or unarchived"));
        }
        if period.status() == status {
            debug!("Budget period {id} is already {status}");
            return Ok(());
        }
        self.db
            .set_period_status(id, status)
            .await
            .pub_result(ErrorType::Storage)?;
        info!("Budget period {id} is now {status}");
        self.schedule(PUSH_PERIODS, |cloud| async move { cloud.push_periods().await });
        Ok(())
    }

    async fn owned_period(&self, id: &str) -> Result<BudgetPeriod> {
        self.period(id)
            .await?
            .ok_or_else(|| Error::validation(format!("There is no budget period {id}")))
    }

    fn check_owner(&self, owner_id: &str) -> Result<()> {
        if owner_id != self.owner_id {
            return Err(Error::validation(format!(
                "The data belongs to '{owner_id}', not '{}'",
                self.owner_id
            )));
        }
        Ok(())
    }

    async fn check_year_is_free(&self, period: &BudgetPeriod) -> Result<()> {
        let existing = self
            .db
            .find_period_by_year(&self.owner_id, period.year())
            .await
            .pub_result(ErrorType::Storage)?;
        match existing {
            Some(existing) if existing.id() != period.id() => Err(Error::validation(format!(
                "A budget period for {} already exists",
                period.year()
            ))),
            _ => Ok(()),
        }
    }

    async fn check_expense(&self, expense: &mut Expense) -> Result<()> {
        self.check_owner(expense.owner_id())?;
        expense.normalize();
        expense
            .validate()
            .pub_result(ErrorType::Validation)?;
        self.owned_period(expense.period_id()).await?;
        Ok(())
    }

    fn check_restore(&self, data: &BudgetData) -> Result<()> {
        let mut period_ids = HashSet::new();
        for period in data.periods() {
            self.check_owner(period.owner_id())?;
            period
                .validate()
                .pub_result(ErrorType::Validation)?;
            period_ids.insert(period.id());
        }
        for expense in data.expenses() {
            self.check_owner(expense.owner_id())?;
            expense
                .validate()
                .pub_result(ErrorType::Validation)?;
            if !period_ids.contains(expense.period_id()) {
                return Err(Error::validation(format!(
                    "Expense {} refers to budget period {}, which is not in the backup",
                    expense.id(),
                    expense.period_id()
                )));
            }
        }
        Ok(())
    }

    /// A unique violation racing past `check_year_is_free` is still a validation error.
    fn classify_insert(&self, e: anyhow::Error, period: &BudgetPeriod) -> Error {
        if is_unique_violation(&e) {
            Error::validation(format!(
                "A budget period for {} already exists",
                period.year()
            ))
        } else {
            Error::new(ErrorType::Storage, e)
        }
    }
}
