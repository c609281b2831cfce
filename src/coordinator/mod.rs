//! The operation coordinator serializes and deduplicates sync operations.
//!
//! Debounced operations are queued and run as one batch once the debounce timer has been quiet
//! for its full delay. Immediate operations skip the queue but still wait for the single-flight
//! lock, so at most one sync is in flight at any time. The lock is a `tokio::sync::Mutex`, which
//! serves waiters in the order they asked and forgets a waiter that gives up.

mod phase;

pub use phase::Phase;

use crate::error::Res;
use phase::{Effect, Event};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The future returned by a sync operation.
pub type OpFuture = Pin<Box<dyn Future<Output = Res<()>> + Send>>;

/// One unit of reconciliation work. It is called at most once.
pub type SyncOp = Box<dyn FnOnce() -> OpFuture + Send>;

/// Boxes an async closure into a `SyncOp`.
pub fn op<F, Fut>(f: F) -> SyncOp
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Res<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Timing of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Quiet time after the last debounced call before the queue is drained.
    pub debounce: Duration,
    /// Width of the time bucket that is part of an operation id.
    pub dedup_window: Duration,
    /// How long processed ids are remembered after a batch.
    pub processed_retention: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            dedup_window: Duration::from_millis(1000),
            processed_retention: Duration::from_millis(5000),
        }
    }
}

/// What `Coordinator::enqueue` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added to the queue.
    Queued,
    /// An operation with the same id was already queued and has been replaced.
    Replaced,
    /// An operation with the same id was processed recently; nothing was queued.
    Skipped,
}

/// Builds the id of an operation from its key and the dedup bucket `elapsed` falls in.
pub(crate) fn operation_id(key: &str, elapsed: Duration, window: Duration) -> String {
    let window_ms = window.as_millis().max(1);
    format!("{key}@{}", elapsed.as_millis() / window_ms)
}

struct Queued {
    id: String,
    op: SyncOp,
}

#[derive(Default)]
struct State {
    phase: Phase,
    queue: VecDeque<Queued>,
    processed: HashSet<String>,
    /// A drain was requested while the lock was held.
    drain_pending: bool,
    timer: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    batches: u64,
}

struct Inner {
    settings: CoordinatorSettings,
    epoch: Instant,
    state: Mutex<State>,
    /// The single-flight lock.
    lock: Arc<AsyncMutex<()>>,
}

/// The operation coordinator. Cheap to clone; clones share the queue and the lock.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Coordinator")
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

/// Holds the single-flight lock. Dropping it releases the lock, which covers early returns and
/// panics inside an operation.
pub struct SyncLock {
    coordinator: Coordinator,
    draining: bool,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if self.draining {
            self.coordinator.finish_drain();
        }
        // Unlock before looking for a pending drain, so the drain can take the lock.
        drop(self.guard.take());
        self.coordinator.after_release();
    }
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                epoch: Instant::now(),
                state: Mutex::new(State::default()),
                lock: Arc::new(AsyncMutex::new(())),
            }),
        }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.inner.settings
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // No code panics while holding the guard, but a poisoned state is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.lock.try_lock().is_err()
    }

    /// The number of operations waiting in the debounced queue.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// The number of batches drained so far.
    pub fn batches(&self) -> u64 {
        self.state().batches
    }

    /// Queues `op` under `key` and (re)arms the debounce timer. Calls with the same key in the
    /// same dedup bucket collapse into one; if that id was processed recently the call is
    /// skipped.
    pub fn enqueue(&self, key: &str, op: SyncOp) -> EnqueueOutcome {
        let id = operation_id(
            key,
            self.inner.epoch.elapsed(),
            self.inner.settings.dedup_window,
        );
        let mut state = self.state();
        if state.processed.contains(&id) {
            trace!("Skipping {id}, it was processed recently");
            return EnqueueOutcome::Skipped;
        }
        let outcome = match state.queue.iter_mut().find(|q| q.id == id) {
            Some(existing) => {
                existing.op = op;
                EnqueueOutcome::Replaced
            }
            None => {
                state.queue.push_back(Queued { id: id.clone(), op });
                EnqueueOutcome::Queued
            }
        };
        trace!("{outcome:?} {id}");
        self.apply(&mut state, Event::Enqueued);
        outcome
    }

    /// Runs `op` as soon as no other sync is in flight and returns its outcome. The debounce
    /// timer is left alone.
    pub async fn run_immediate(&self, op: SyncOp) -> Res<()> {
        let _lock = self.acquire().await;
        op().await
    }

    /// Drains the queue as one batch. Does nothing if the queue is empty. If another sync holds
    /// the lock, the drain happens right after it releases.
    pub async fn process_queue(&self) {
        let lock = {
            let mut state = self.state();
            if state.queue.is_empty() {
                if state.phase == Phase::Draining && !self.is_syncing() {
                    state.phase = Phase::Idle;
                }
                return;
            }
            // Decided under the state lock, which `after_release` takes before reading the flag.
            match self.try_acquire() {
                Some(lock) => lock,
                None => {
                    state.drain_pending = true;
                    return;
                }
            }
        };
        self.drain(lock).await;
    }

    /// Cancels the debounce timer and drains until the queue is empty, waiting for any sync that
    /// is in flight.
    pub async fn flush(&self) {
        loop {
            let lock = self.acquire().await;
            if self.state().queue.is_empty() {
                return;
            }
            self.drain(lock).await;
        }
    }

    /// Empties the queue and the processed ids and cancels all timers. A sync that is in flight
    /// runs to completion.
    pub fn clear_queue(&self) {
        let mut state = self.state();
        state.queue.clear();
        state.processed.clear();
        state.drain_pending = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(cleanup) = state.cleanup.take() {
            cleanup.abort();
        }
        if state.phase == Phase::Armed {
            state.phase = Phase::Idle;
        }
        debug!("Cleared the sync queue");
    }

    /// Waits for the single-flight lock. Waiters get it in the order they asked. Dropping the
    /// returned future gives up the place in line.
    pub async fn acquire(&self) -> SyncLock {
        let guard = self.inner.lock.clone().lock_owned().await;
        self.locked(guard)
    }

    fn try_acquire(&self) -> Option<SyncLock> {
        let guard = self.inner.lock.clone().try_lock_owned().ok()?;
        Some(self.locked(guard))
    }

    fn locked(&self, guard: OwnedMutexGuard<()>) -> SyncLock {
        SyncLock {
            coordinator: self.clone(),
            draining: false,
            guard: Some(guard),
        }
    }

    fn after_release(&self) {
        let mut state = self.state();
        if std::mem::take(&mut state.drain_pending) {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.process_queue().await });
        }
    }

    async fn drain(&self, mut lock: SyncLock) {
        let batch: Vec<Queued> = {
            let mut state = self.state();
            lock.draining = true;
            state.batches += 1;
            self.apply(&mut state, Event::DrainStarted);
            state.queue.drain(..).collect()
        };
        debug!("Running a batch of {} sync operation(s)", batch.len());
        for Queued { id, op } in batch {
            if let Err(e) = op().await {
                warn!("Sync operation {id} failed: {e:#}");
            }
            self.state().processed.insert(id);
        }
        self.schedule_cleanup();
        drop(lock);
    }

    fn finish_drain(&self) {
        let mut state = self.state();
        let queue_empty = state.queue.is_empty();
        self.apply(&mut state, Event::DrainFinished { queue_empty });
    }

    fn on_timer_fired(&self) {
        let mut state = self.state();
        state.timer = None;
        self.apply(&mut state, Event::TimerFired);
    }

    fn apply(&self, state: &mut State, event: Event) {
        let (phase, effect) = phase::next(state.phase, event);
        trace!("{:?} --{event:?}--> {phase:?} ({effect:?})", state.phase);
        state.phase = phase;
        match effect {
            Effect::None => {}
            Effect::ArmTimer => {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let coordinator = self.clone();
                let delay = self.inner.settings.debounce;
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    coordinator.on_timer_fired();
                }));
            }
            Effect::CancelTimer => {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
            Effect::Drain => {
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.process_queue().await });
            }
        }
    }

    fn schedule_cleanup(&self) {
        let mut state = self.state();
        if let Some(cleanup) = state.cleanup.take() {
            cleanup.abort();
        }
        let coordinator = self.clone();
        let retention = self.inner.settings.processed_retention;
        state.cleanup = Some(tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut state = coordinator.state();
            trace!("Forgetting {} processed operation id(s)", state.processed.len());
            state.processed.clear();
            state.cleanup = None;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(debounce: u64, window: u64, retention: u64) -> CoordinatorSettings {
        CoordinatorSettings {
            debounce: Duration::from_millis(debounce),
            dedup_window: Duration::from_millis(window),
            processed_retention: Duration::from_millis(retention),
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> SyncOp {
        let counter = counter.clone();
        op(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_operation_id_buckets() {
        let w = Duration::from_millis(1000);
        assert_eq!(operation_id("a", Duration::from_millis(999), w), "a@0");
        assert_eq!(operation_id("a", Duration::from_millis(1000), w), "a@1");
        assert_eq!(operation_id("b", Duration::from_millis(2500), w), "b@2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_distinct_operations_runs_as_one_batch() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let counters: Vec<Arc<AtomicUsize>> =
            (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for (ix, counter) in counters.iter().enumerate() {
            let outcome = coordinator.enqueue(&format!("op-{ix}"), counting(counter));
            assert_eq!(outcome, EnqueueOutcome::Queued);
            sleep_ms(100).await;
        }
        // The last call was 100ms ago; the timer restarts on every call.
        assert_eq!(coordinator.phase(), Phase::Armed);
        sleep_ms(850).await;
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 0));

        sleep_ms(100).await;
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(coordinator.batches(), 1);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(!coordinator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_replaced() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            coordinator.enqueue("push", counting(&first)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            coordinator.enqueue("push", counting(&second)),
            EnqueueOutcome::Replaced
        );
        assert_eq!(coordinator.queued(), 1);
        sleep_ms(1100).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_processed_is_skipped_until_cleanup() {
        let coordinator = Coordinator::new(settings(100, 10_000, 500));
        let counter = Arc::new(AtomicUsize::new(0));
        coordinator.enqueue("push", counting(&counter));
        sleep_ms(150).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert_eq!(
            coordinator.enqueue("push", counting(&counter)),
            EnqueueOutcome::Skipped
        );
        sleep_ms(600).await;
        assert_eq!(
            coordinator.enqueue("push", counting(&counter)),
            EnqueueOutcome::Queued
        );
        sleep_ms(150).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_stop_siblings() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let counter = Arc::new(AtomicUsize::new(0));
        coordinator.enqueue("a", counting(&counter));
        coordinator.enqueue("b", op(|| async { anyhow::bail!("remote down") }));
        coordinator.enqueue("c", counting(&counter));
        sleep_ms(1100).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_releases_lock() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        coordinator.enqueue("boom", op(|| async { panic!("operation panicked") }));
        sleep_ms(1100).await;
        assert!(!coordinator.is_syncing());
        assert_eq!(coordinator.phase(), Phase::Idle);

        let counter = Arc::new(AtomicUsize::new(0));
        coordinator
            .run_immediate(counting(&counter))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_waits_for_batch_and_runs_in_order() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let batch_log = log.clone();
        coordinator.enqueue(
            "slow",
            op(move || async move {
                batch_log.lock().unwrap().push("batch-start".to_string());
                tokio::time::sleep(Duration::from_millis(500)).await;
                batch_log.lock().unwrap().push("batch-end".to_string());
                Ok(())
            }),
        );
        sleep_ms(1100).await;
        assert!(coordinator.is_syncing());

        let mut handles = Vec::new();
        for ix in 0..3 {
            let c = coordinator.clone();
            let entry_log = log.clone();
            handles.push(tokio::spawn(async move {
                c.run_immediate(op(move || async move {
                    entry_log.lock().unwrap().push(format!("immediate-{ix}"));
                    Ok(())
                }))
                .await
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "batch-start",
                "batch-end",
                "immediate-0",
                "immediate-1",
                "immediate-2"
            ]
        );
        assert!(!coordinator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_returns_operation_error() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let result = coordinator
            .run_immediate(op(|| async { anyhow::bail!("rejected") }))
            .await;
        assert!(result.unwrap_err().to_string().contains("rejected"));
        assert!(!coordinator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_while_locked_runs_after_release() {
        let coordinator = Coordinator::new(settings(10_000, 1000, 5000));
        let counter = Arc::new(AtomicUsize::new(0));
        let lock = coordinator.acquire().await;
        coordinator.enqueue("a", counting(&counter));
        coordinator.process_queue().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        drop(lock);
        sleep_ms(10).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_keep_the_lock() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let lock = coordinator.acquire().await;
        let c = coordinator.clone();
        let waiter = tokio::spawn(async move {
            let _lock = c.acquire().await;
            sleep_ms(60_000).await;
        });
        tokio::task::yield_now().await;

        // The lock passes to the waiter, which is cancelled before it runs again.
        drop(lock);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(!coordinator.is_syncing());

        let counter = Arc::new(AtomicUsize::new(0));
        tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.run_immediate(counting(&counter)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_on_empty_queue_is_noop() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        coordinator.process_queue().await;
        assert_eq!(coordinator.batches(), 0);
        assert!(!coordinator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_cancels_timer() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let counter = Arc::new(AtomicUsize::new(0));
        coordinator.enqueue("a", counting(&counter));
        coordinator.clear_queue();
        assert_eq!(coordinator.phase(), Phase::Idle);
        sleep_ms(2000).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_without_waiting_for_debounce() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let counter = Arc::new(AtomicUsize::new(0));
        coordinator.enqueue("a", counting(&counter));
        coordinator.enqueue("b", counting(&counter));
        let start = Instant::now();
        coordinator.flush().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.phase(), Phase::Idle);

        // The cancelled timer does not cause a second batch.
        sleep_ms(2000).await;
        assert_eq!(coordinator.batches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_during_batch_rearms() {
        let coordinator = Coordinator::new(CoordinatorSettings::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = coordinator.clone();
        let inner_counter = counter.clone();
        coordinator.enqueue(
            "outer",
            op(move || async move {
                c.enqueue("inner", counting(&inner_counter));
                Ok(())
            }),
        );
        sleep_ms(1100).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.phase(), Phase::Armed);
        sleep_ms(1000).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.batches(), 2);
    }
}
