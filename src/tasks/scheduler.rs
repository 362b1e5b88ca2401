//! # Task Scheduler
//!
//! Owns execution of every side-effecting operation: claims runnable rows
//! from the store honoring capacity, category mutual exclusion, dependency
//! gating, and priority/age order, then drives handlers to a terminal state.
//!
//! All in-memory coordination state (running map + category locks) lives in
//! one `SchedulerState` behind a single mutex. The database remains the
//! authority for task state; the maps only gate what gets claimed next and
//! carry cancellation handles.
//!
//! The loop ticks on a fixed interval and opportunistically whenever a task
//! completes or `EngineHandle::notify` is called after an enqueue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::SystemContext;
use crate::error::EngineResult;

use super::locks::CategoryLockSet;
use super::progress::{run_progress_writer, ProgressPublisher};
use super::registry::{HandlerContext, HandlerOutcome, HandlerRegistry, OperationCategory};
use super::store::TaskStore;
use super::types::{NewTask, Task, TaskStatus};

/// Executions longer than this are reported on the perf channel
const SLOW_EXECUTION: Duration = Duration::from_secs(5);

/// After a handler timeout, how long the cooperative unwind (cancellation
/// token -> subprocess SIGTERM path) gets before the task is aborted.
const HANDLER_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight handlers to finalize
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct RunningTask {
    operation: String,
    category: Option<OperationCategory>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: HashMap<Uuid, RunningTask>,
    locks: CategoryLockSet,
}

enum DispatchOutcome {
    Completed(HandlerOutcome),
    Failed(String),
}

struct EngineInner {
    context: SystemContext,
    store: TaskStore,
    registry: HandlerRegistry,
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: CancellationToken,
    processor_running: AtomicBool,
    max_concurrent: usize,
    tick_interval: Duration,
    progress_interval: Duration,
}

/// The task execution engine. `run` consumes the scheduler loop; cheap
/// [`EngineHandle`] clones serve the web layer and periodic drivers.
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

/// Shared handle for enqueueing, live metrics, and shutdown
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(context: SystemContext, registry: HandlerRegistry) -> Self {
        let max_concurrent = context.config().max_concurrent_tasks;
        let tick_interval = Duration::from_secs(context.config().tick_interval_seconds.max(1));
        let progress_interval =
            Duration::from_secs(context.config().download.progress_update_seconds.max(1));
        let store = TaskStore::new(context.pool().clone());

        let inner = EngineInner {
            store,
            registry,
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            processor_running: AtomicBool::new(false),
            max_concurrent,
            tick_interval,
            progress_interval,
            context,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run the scheduler until shutdown. The startup recovery sweep happens
    /// before the first claim, so no previous process's `running` rows
    /// survive into this scheduler's view.
    pub async fn run(self) {
        let inner = self.inner;

        match inner.store.fail_orphaned_running().await {
            Ok(0) => {}
            Ok(orphaned) => info!(orphaned = orphaned, "recovery sweep finished"),
            Err(e) => error!(error = %e, "recovery sweep failed"),
        }

        inner.processor_running.store(true, Ordering::SeqCst);
        info!(
            max_concurrent = inner.max_concurrent,
            tick_interval_secs = inner.tick_interval.as_secs(),
            "task scheduler started"
        );

        let mut tick = tokio::time::interval(inner.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = inner.wake.notified() => {}
            }

            if let Err(e) = EngineInner::dispatch_ready(&inner).await {
                error!(error = %e, "scheduler tick failed");
            }
        }

        inner.processor_running.store(false, Ordering::SeqCst);
        inner.drain().await;
        info!("task scheduler stopped");
    }
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim and dispatch runnable tasks until capacity is reached or the
    /// store runs dry. Idempotent when nothing is claimable.
    async fn dispatch_ready(inner: &Arc<Self>) -> EngineResult<()> {
        loop {
            let excluded = {
                let state = inner.state();
                if state.running.len() >= inner.max_concurrent {
                    return Ok(());
                }
                inner.registry.operations_in_categories(state.locks.held())
            };

            let Some(task) = inner.store.try_claim_next(&excluded).await? else {
                return Ok(());
            };

            let category = inner.registry.category_of(&task.operation);
            let cancel = inner.shutdown.child_token();
            let lock_race = {
                let mut state = inner.state();
                if let Some(category) = category {
                    // The category could have been taken between computing
                    // the exclusion set and this acquisition; the claim is
                    // reverted rather than run out of order.
                    if !state.locks.try_acquire(category) {
                        true
                    } else {
                        state.running.insert(
                            task.id,
                            RunningTask {
                                operation: task.operation.clone(),
                                category: Some(category),
                                cancel: cancel.clone(),
                            },
                        );
                        false
                    }
                } else {
                    state.running.insert(
                        task.id,
                        RunningTask {
                            operation: task.operation.clone(),
                            category,
                            cancel: cancel.clone(),
                        },
                    );
                    false
                }
            };

            if lock_race {
                warn!(
                    task_id = %task.id,
                    category = ?category,
                    "category lock race, reverting claim"
                );
                inner.store.revert_claim(task.id).await?;
                return Ok(());
            }

            let engine = Arc::clone(inner);
            tokio::spawn(async move {
                engine.execute(task, cancel).await;
            });
        }
    }

    /// Drive one claimed task to a terminal row, then free its slot and
    /// category on every path.
    async fn execute(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let task_id = task.id;
        let operation = task.operation.clone();
        let started = Instant::now();

        info!(
            task_id = %task_id,
            operation = %operation,
            target = %task.target,
            priority = ?task.priority,
            "task started"
        );

        let (publisher, progress_rx) = ProgressPublisher::channel();
        let writer = tokio::spawn(run_progress_writer(
            self.store.clone(),
            task_id,
            progress_rx,
            self.progress_interval,
        ));

        let outcome = self.dispatch_handler(task, cancel, publisher).await;

        // All publisher clones are gone once the handler resolves, so the
        // writer flushes its final snapshot and exits.
        if let Err(e) = writer.await {
            debug!(task_id = %task_id, error = %e, "progress writer aborted");
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_EXECUTION {
            warn!(
                target: "zoneforge::perf",
                task_id = %task_id,
                operation = %operation,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow task execution"
            );
        }

        let (status, error_message, progress_info) = match outcome {
            DispatchOutcome::Completed(outcome) => {
                (TaskStatus::Completed, None, outcome_info(&outcome))
            }
            DispatchOutcome::Failed(message) => (TaskStatus::Failed, Some(message), None),
        };

        match self
            .store
            .finalize(
                task_id,
                status,
                error_message.as_deref(),
                progress_info.as_ref(),
            )
            .await
        {
            Ok(Some(_)) => info!(
                task_id = %task_id,
                operation = %operation,
                status = %status,
                elapsed_ms = elapsed.as_millis() as u64,
                "task finished"
            ),
            Ok(None) => warn!(task_id = %task_id, "finalize found no running row"),
            Err(e) => error!(task_id = %task_id, error = %e, "failed to finalize task"),
        }

        {
            let mut state = self.state();
            if let Some(running) = state.running.remove(&task_id) {
                if let Some(category) = running.category {
                    state.locks.release(category);
                }
            }
        }

        // Completion frees capacity (and possibly a category); look again.
        self.wake.notify_one();
    }

    /// Central safe dispatch: panics, handler errors, and wall-clock
    /// timeouts all become `failed` results instead of crossing the
    /// scheduler boundary.
    async fn dispatch_handler(
        &self,
        task: Task,
        cancel: CancellationToken,
        publisher: ProgressPublisher,
    ) -> DispatchOutcome {
        let operation = task.operation.clone();
        let Some(registered) = self.registry.get(&operation) else {
            return DispatchOutcome::Failed(format!(
                "no handler registered for operation '{operation}'"
            ));
        };
        let timeout = registered.timeout;
        let handler = Arc::clone(&registered.handler);
        let ctx = HandlerContext {
            task,
            cancel: cancel.clone(),
            system: self.context.clone(),
        };

        let mut join = tokio::spawn(async move { handler.handle(ctx, publisher).await });

        let result = tokio::select! {
            res = &mut join => Some(res),
            _ = tokio::time::sleep(timeout) => None,
        };

        match result {
            None => {
                cancel.cancel();
                if tokio::time::timeout(HANDLER_CANCEL_GRACE, &mut join)
                    .await
                    .is_err()
                {
                    join.abort();
                }
                DispatchOutcome::Failed(format!(
                    "handler for '{operation}' timed out after {}s",
                    timeout.as_secs()
                ))
            }
            Some(Ok(Ok(outcome))) => DispatchOutcome::Completed(outcome),
            Some(Ok(Err(e))) => DispatchOutcome::Failed(e.to_string()),
            Some(Err(join_error)) => {
                if join_error.is_panic() {
                    error!(operation = %operation, "handler panicked");
                    DispatchOutcome::Failed(format!("handler for '{operation}' panicked"))
                } else {
                    DispatchOutcome::Failed(format!("handler for '{operation}' was aborted"))
                }
            }
        }
    }

    async fn drain(&self) {
        // Tell every in-flight handler to stop, then wait for their
        // finalization writes.
        let cancels: Vec<CancellationToken> = self
            .state()
            .running
            .values()
            .map(|running| running.cancel.clone())
            .collect();
        for cancel in cancels {
            cancel.cancel();
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        loop {
            let still_running = self.state().running.len();
            if still_running == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(still_running = still_running, "shutdown drain timed out");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl EngineHandle {
    /// Enqueue a task and nudge the scheduler
    pub async fn enqueue(&self, spec: NewTask) -> EngineResult<Task> {
        let task = self.inner.store.create(spec).await?;
        self.inner.wake.notify_one();
        Ok(task)
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    /// Live count of in-process executions (not a durable metric)
    pub fn running_count(&self) -> usize {
        self.inner.state().running.len()
    }

    pub fn is_processor_running(&self) -> bool {
        self.inner.processor_running.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Wake the scheduler loop (after an out-of-band enqueue)
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Token that fires when the engine shuts down; periodic drivers select
    /// on it to stop alongside the scheduler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn config(&self) -> &crate::config::EngineConfig {
        self.inner.context.config()
    }

    /// Operations currently running, for diagnostics
    pub fn running_operations(&self) -> Vec<String> {
        self.inner
            .state()
            .running
            .values()
            .map(|r| r.operation.clone())
            .collect()
    }
}

fn outcome_info(outcome: &HandlerOutcome) -> Option<Value> {
    if outcome.message.is_none() && outcome.extra.is_none() {
        return None;
    }
    let mut map = serde_json::Map::new();
    if let Some(message) = &outcome.message {
        map.insert("message".to_string(), Value::String(message.clone()));
    }
    match &outcome.extra {
        Some(Value::Object(fields)) => map.extend(fields.clone()),
        Some(other) => {
            map.insert("extra".to_string(), other.clone());
        }
        None => {}
    }
    Some(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::tasks::registry::TaskHandler;
    use crate::tasks::types::TaskPriority;
    use async_trait::async_trait;
    use sqlx::PgPool;
    use std::sync::atomic::AtomicUsize;

    /// Handler that sleeps, then records its target in execution order and
    /// tracks peak concurrency.
    struct ProbeHandler {
        sleep: Duration,
        order: Arc<Mutex<Vec<String>>>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ProbeHandler {
        fn new(sleep: Duration) -> (Arc<Self>, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
            let order = Arc::new(Mutex::new(Vec::new()));
            let peak = Arc::new(AtomicUsize::new(0));
            let handler = Arc::new(Self {
                sleep,
                order: Arc::clone(&order),
                current: Arc::new(AtomicUsize::new(0)),
                peak: Arc::clone(&peak),
            });
            (handler, order, peak)
        }
    }

    #[async_trait]
    impl TaskHandler for ProbeHandler {
        async fn handle(
            &self,
            ctx: HandlerContext,
            _progress: ProgressPublisher,
        ) -> crate::error::EngineResult<HandlerOutcome> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.sleep).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.order
                .lock()
                .unwrap()
                .push(ctx.task.target.clone());
            Ok(HandlerOutcome::with_message(format!(
                "probe {} done",
                ctx.task.target
            )))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(
            &self,
            _ctx: HandlerContext,
            _progress: ProgressPublisher,
        ) -> crate::error::EngineResult<HandlerOutcome> {
            Err(EngineError::Command("dladm exploded".to_string()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        async fn handle(
            &self,
            _ctx: HandlerContext,
            _progress: ProgressPublisher,
        ) -> crate::error::EngineResult<HandlerOutcome> {
            panic!("handler bug");
        }
    }

    struct StallingHandler;

    #[async_trait]
    impl TaskHandler for StallingHandler {
        async fn handle(
            &self,
            ctx: HandlerContext,
            _progress: ProgressPublisher,
        ) -> crate::error::EngineResult<HandlerOutcome> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(600)) => Ok(HandlerOutcome::ok()),
                _ = ctx.cancel.cancelled() => {
                    Err(EngineError::Timeout("stalled handler unwound".to_string()))
                }
            }
        }
    }

    fn start_engine(
        pool: PgPool,
        registry: HandlerRegistry,
        max_concurrent: usize,
    ) -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let config = EngineConfig {
            max_concurrent_tasks: max_concurrent,
            tick_interval_seconds: 1,
            ..Default::default()
        };
        let context = SystemContext::new(pool, config).unwrap();
        let engine = TaskEngine::new(context, registry);
        let handle = engine.handle();
        let join = tokio::spawn(engine.run());
        (handle, join)
    }

    async fn wait_terminal(handle: &EngineHandle, id: Uuid) -> Task {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let task = handle.store().get(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(Instant::now() < deadline, "task {id} never finished");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn backdate(pool: &PgPool, id: Uuid, seconds_ago: i64) {
        sqlx::query(
            "UPDATE tasks SET created_at = now() - make_interval(secs => $2) WHERE id = $1",
        )
        .bind(id)
        .bind(seconds_ago as f64)
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_priority_then_age_execution_order(pool: PgPool) {
        let (handler, order, _) = ProbeHandler::new(Duration::from_millis(20));
        let mut registry = HandlerRegistry::new();
        registry.register("service_refresh", handler).unwrap();

        let store = TaskStore::new(pool.clone());
        let background = store
            .create(
                NewTask::new("service_refresh", "background")
                    .with_priority(TaskPriority::Background),
            )
            .await
            .unwrap();
        let medium_old = store
            .create(NewTask::new("service_refresh", "medium-old"))
            .await
            .unwrap();
        let medium_new = store
            .create(NewTask::new("service_refresh", "medium-new"))
            .await
            .unwrap();
        backdate(&pool, background.id, 300).await;
        backdate(&pool, medium_old.id, 200).await;
        backdate(&pool, medium_new.id, 100).await;

        let (handle, _join) = start_engine(pool, registry, 1);
        handle.notify();

        for id in [background.id, medium_old.id, medium_new.id] {
            let task = wait_terminal(&handle, id).await;
            assert_eq!(task.status, TaskStatus::Completed);
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["medium-old", "medium-new", "background"]);
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_category_serialization(pool: PgPool) {
        let (handler, _, peak) = ProbeHandler::new(Duration::from_millis(100));
        let mut registry = HandlerRegistry::new();
        registry.register("create_vnic", handler).unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let a = handle
            .enqueue(NewTask::new("create_vnic", "vnic-a"))
            .await
            .unwrap();
        let b = handle
            .enqueue(NewTask::new("create_vnic", "vnic-b"))
            .await
            .unwrap();

        let done_a = wait_terminal(&handle, a.id).await;
        let done_b = wait_terminal(&handle, b.id).await;

        assert_eq!(done_a.status, TaskStatus::Completed);
        assert_eq!(done_b.status, TaskStatus::Completed);
        // Shared category: never concurrent despite free capacity.
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // The second run starts only after the first finalized.
        let (first, second) = if done_a.completed_at <= done_b.completed_at {
            (done_a, done_b)
        } else {
            (done_b, done_a)
        };
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_capacity_ceiling(pool: PgPool) {
        let (handler, _, peak) = ProbeHandler::new(Duration::from_millis(80));
        let mut registry = HandlerRegistry::new();
        registry.register("service_restart", handler).unwrap();

        let (handle, _join) = start_engine(pool, registry, 2);
        let mut ids = Vec::new();
        for i in 0..5 {
            let task = handle
                .enqueue(NewTask::new("service_restart", format!("svc-{i}")))
                .await
                .unwrap();
            ids.push(task.id);
        }

        for id in ids {
            let task = wait_terminal(&handle, id).await;
            assert_eq!(task.status, TaskStatus::Completed);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_dependency_waits_for_completion(pool: PgPool) {
        let (handler, _, _) = ProbeHandler::new(Duration::from_millis(120));
        let mut registry = HandlerRegistry::new();
        registry.register("pkg_update", Arc::clone(&handler) as Arc<dyn TaskHandler>).unwrap();
        registry.register("pkg_refresh", handler).unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let predecessor = handle
            .enqueue(NewTask::new("pkg_update", "system"))
            .await
            .unwrap();
        let dependent = handle
            .enqueue(NewTask::new("pkg_refresh", "system").with_depends_on(predecessor.id))
            .await
            .unwrap();

        let done_pred = wait_terminal(&handle, predecessor.id).await;
        let done_dep = wait_terminal(&handle, dependent.id).await;

        assert_eq!(done_pred.status, TaskStatus::Completed);
        assert_eq!(done_dep.status, TaskStatus::Completed);
        assert!(done_dep.started_at.unwrap() >= done_pred.completed_at.unwrap());
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_handler_error_becomes_failed_row(pool: PgPool) {
        let mut registry = HandlerRegistry::new();
        registry
            .register("create_vnic", Arc::new(FailingHandler))
            .unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let task = handle
            .enqueue(NewTask::new("create_vnic", "vnic0"))
            .await
            .unwrap();

        let done = wait_terminal(&handle, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error_message.unwrap().contains("dladm exploded"));

        // The category lock must be free again: a follow-up task runs.
        let retry = handle
            .enqueue(NewTask::new("create_vnic", "vnic1"))
            .await
            .unwrap();
        let done_retry = wait_terminal(&handle, retry.id).await;
        assert_eq!(done_retry.status, TaskStatus::Failed);
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_handler_panic_becomes_failed_row(pool: PgPool) {
        let mut registry = HandlerRegistry::new();
        registry
            .register("set_hostname", Arc::new(PanickingHandler))
            .unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let task = handle
            .enqueue(NewTask::new("set_hostname", "system"))
            .await
            .unwrap();

        let done = wait_terminal(&handle, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error_message.unwrap().contains("panicked"));

        // system_config must be released after the panic.
        assert_eq!(handle.running_count(), 0);
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_unregistered_operation_fails(pool: PgPool) {
        let registry = HandlerRegistry::new();
        let (handle, _join) = start_engine(pool, registry, 5);
        let task = handle
            .enqueue(NewTask::new("file_move", "system"))
            .await
            .unwrap();

        let done = wait_terminal(&handle, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done
            .error_message
            .unwrap()
            .contains("no handler registered"));
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_recovery_sweep_runs_before_claims(pool: PgPool) {
        let store = TaskStore::new(pool.clone());
        store
            .create(NewTask::new("create_vnic", "vnic0"))
            .await
            .unwrap();
        let orphan = store.try_claim_next(&[]).await.unwrap().unwrap();

        let registry = HandlerRegistry::new();
        let (handle, _join) = start_engine(pool, registry, 5);

        let failed = wait_terminal(&handle, orphan.id).await;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.unwrap().contains("orphaned"));
        // The orphan's category is not held by the fresh scheduler.
        assert_eq!(handle.running_count(), 0);
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_completed_outcome_surfaces_message(pool: PgPool) {
        let (handler, _, _) = ProbeHandler::new(Duration::from_millis(10));
        let mut registry = HandlerRegistry::new();
        registry.register("service_enable", handler).unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let task = handle
            .enqueue(NewTask::new("service_enable", "svc:/network/ssh"))
            .await
            .unwrap();

        let done = wait_terminal(&handle, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress_percent, 100);
        let info = done.progress_info.unwrap();
        assert!(info["message"].as_str().unwrap().contains("done"));
        handle.shutdown();
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_shutdown_stops_loop(pool: PgPool) {
        let registry = HandlerRegistry::new();
        let (handle, join) = start_engine(pool, registry, 5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_processor_running());

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(!handle.is_processor_running());
    }

    #[test]
    fn test_outcome_info_merges_extra_fields() {
        let outcome = HandlerOutcome::with_message("downloaded")
            .with_extra(serde_json::json!({"size": 42, "checksum": "ab"}));
        let info = outcome_info(&outcome).unwrap();
        assert_eq!(info["message"], "downloaded");
        assert_eq!(info["size"], 42);
        assert_eq!(info["checksum"], "ab");
    }

    #[test]
    fn test_outcome_info_empty_is_none() {
        assert!(outcome_info(&HandlerOutcome::ok()).is_none());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_handler_timeout_fails_task_and_frees_category(pool: PgPool) {
        let mut registry = HandlerRegistry::new();
        registry
            .register_with_timeout(
                "pkg_install",
                Arc::new(StallingHandler),
                Duration::from_millis(200),
            )
            .unwrap();
        let (probe, _, _) = ProbeHandler::new(Duration::from_millis(10));
        registry.register("pkg_refresh", probe).unwrap();

        let (handle, _join) = start_engine(pool, registry, 5);
        let stalled = handle
            .enqueue(NewTask::new("pkg_install", "system"))
            .await
            .unwrap();

        let done = wait_terminal(&handle, stalled.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error_message.unwrap().contains("timed out"));

        // package_management is free again after the timeout path.
        let follow_up = handle
            .enqueue(NewTask::new("pkg_refresh", "system"))
            .await
            .unwrap();
        let done_follow_up = wait_terminal(&handle, follow_up.id).await;
        assert_eq!(done_follow_up.status, TaskStatus::Completed);
        handle.shutdown();
    }
}
