//! Pipeline execution
//!
//! A [`TaskRunner`] executes one pipeline against a [`TaskContext`]. It stops
//! at the first failing task, invokes exactly one of its continuations, and
//! can be bounded by a timeout. When the timeout wins, the failure
//! continuation runs with a timeout fault and a completion arriving later is
//! dropped. Runners are single-use: [`TaskRunner::run`] consumes the runner.

use std::fmt;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use escrow_core::errors::TaskError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Resolved, TaskContext, TaskKind, TaskRegistry};
use crate::scheduler::TimerHandle;

// ----------------------------------------------------------------------------
// Outcome Types
// ----------------------------------------------------------------------------

/// Why a pipeline did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFault {
    pub transition: &'static str,
    /// Failing task; `None` for timeouts
    pub task: Option<TaskKind>,
    pub reason: String,
    pub timed_out: bool,
}

impl PipelineFault {
    fn task_failed(transition: &'static str, task: TaskKind, error: TaskError) -> Self {
        Self {
            transition,
            task: Some(task),
            reason: error.to_string(),
            timed_out: false,
        }
    }

    fn timeout(transition: &'static str, after: Duration) -> Self {
        Self {
            transition,
            task: None,
            reason: format!(
                "Timeout reached. Protocol did not complete in {} sec.",
                after.as_secs()
            ),
            timed_out: true,
        }
    }
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task {
            Some(task) => write!(f, "{} failed at {}: {}", self.transition, task, self.reason),
            None => write!(f, "{}: {}", self.transition, self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(PipelineFault),
    TimedOut,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    pub fn error(&self) -> Option<String> {
        match self {
            RunOutcome::Completed => None,
            RunOutcome::Failed(fault) => Some(fault.reason.clone()),
            RunOutcome::TimedOut => Some("pipeline timed out".to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Continuations
// ----------------------------------------------------------------------------

type SuccessHandler = Box<dyn FnOnce() + Send>;
type FailureHandler = Box<dyn FnOnce(PipelineFault) + Send>;

#[derive(Default)]
struct Continuations {
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
}

/// Whoever takes the continuations first decides the run's fate
type SharedContinuations = Arc<Mutex<Option<Continuations>>>;

fn take(continuations: &SharedContinuations) -> Option<Continuations> {
    continuations
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
}

// ----------------------------------------------------------------------------
// Task Runner
// ----------------------------------------------------------------------------

pub struct TaskRunner {
    transition: &'static str,
    tasks: &'static [TaskKind],
    registry: Arc<TaskRegistry>,
    timeout: Option<Duration>,
    continuations: Continuations,
}

impl TaskRunner {
    pub fn new(
        transition: &'static str,
        tasks: &'static [TaskKind],
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            transition,
            tasks,
            registry,
            timeout: None,
            continuations: Continuations::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.continuations.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(PipelineFault) + Send + 'static,
    {
        self.continuations.on_failure = Some(Box::new(handler));
        self
    }

    /// Execute the pipeline and hand the context back with the outcome
    pub async fn run(self, mut ctx: TaskContext) -> (TaskContext, RunOutcome) {
        let transition = self.transition;
        let trade_id = ctx.trade.id.clone();
        info!(trade_id = %trade_id, transition, tasks = self.tasks.len(), "Pipeline started");

        let shared: SharedContinuations = Arc::new(Mutex::new(Some(self.continuations)));
        let (expired_tx, expired_rx) = watch::channel(false);

        let timer = self.timeout.map(|after| {
            let shared = shared.clone();
            let trade_id = trade_id.clone();
            TimerHandle::once(after, move || {
                if let Some(handlers) = take(&shared) {
                    warn!(trade_id = %trade_id, transition, "Pipeline timed out");
                    if let Some(on_failure) = handlers.on_failure {
                        on_failure(PipelineFault::timeout(transition, after));
                    }
                }
                let _ = expired_tx.send(true);
            })
        });

        let finished = tokio::select! {
            biased;
            result = run_steps(transition, self.tasks, &self.registry, &mut ctx) => Some(result),
            _ = wait_expired(expired_rx) => None,
        };

        if let Some(timer) = &timer {
            timer.cancel();
        }

        let outcome = match finished {
            Some(result) => match take(&shared) {
                Some(handlers) => match result {
                    Ok(()) => {
                        info!(trade_id = %trade_id, transition, "Pipeline completed");
                        if let Some(on_success) = handlers.on_success {
                            on_success();
                        }
                        RunOutcome::Completed
                    }
                    Err(fault) => {
                        warn!(trade_id = %trade_id, fault = %fault, "Pipeline failed");
                        if let Some(on_failure) = handlers.on_failure {
                            on_failure(fault.clone());
                        }
                        RunOutcome::Failed(fault)
                    }
                },
                None => {
                    debug!(trade_id = %trade_id, transition, "Pipeline finished after its timeout, result dropped");
                    RunOutcome::TimedOut
                }
            },
            None => RunOutcome::TimedOut,
        };

        (ctx, outcome)
    }
}

async fn run_steps(
    transition: &'static str,
    tasks: &'static [TaskKind],
    registry: &TaskRegistry,
    ctx: &mut TaskContext,
) -> Result<(), PipelineFault> {
    for (cursor, kind) in tasks.iter().copied().enumerate() {
        debug!(trade_id = %ctx.trade.id, transition, cursor, task = %kind, "Running task");
        let result = match registry.resolve(kind) {
            Resolved::Run(task) => task.run(ctx).await,
            Resolved::Skip => {
                debug!(task = %kind, "Task skipped by intercept");
                Ok(())
            }
            Resolved::Fail(reason) => Err(TaskError::Intercepted {
                task: kind.to_string(),
                reason,
            }),
            Resolved::Missing => Err(TaskError::NotRegistered {
                task: kind.to_string(),
            }),
        };
        result.map_err(|error| PipelineFault::task_failed(transition, kind, error))?;
    }
    Ok(())
}

/// Resolves once the timer marked the run expired
async fn wait_expired(mut expired: watch::Receiver<bool>) {
    loop {
        if *expired.borrow() {
            return;
        }
        if expired.changed().await.is_err() {
            // Timer dropped without firing
            pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::{context, maker_services};
    use crate::task::{Intercept, Task};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        kind: TaskKind,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for Counting {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn run(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Task for Failing {
        fn kind(&self) -> TaskKind {
            TaskKind::VerifyPeersAccountAgeWitness
        }

        async fn run(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            Err(TaskError::verification("witness too young"))
        }
    }

    struct Sleeping(Duration);

    #[async_trait]
    impl Task for Sleeping {
        fn kind(&self) -> TaskKind {
            TaskKind::SignDepositTx
        }

        async fn run(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    const PIPELINE: &[TaskKind] = &[
        TaskKind::ApplyFilter,
        TaskKind::VerifyPeersAccountAgeWitness,
        TaskKind::CloseTrade,
    ];

    fn registry(first: Arc<AtomicUsize>, last: Arc<AtomicUsize>) -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::empty();
        registry.register(Arc::new(Counting {
            kind: TaskKind::ApplyFilter,
            runs: first,
        }));
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Counting {
            kind: TaskKind::CloseTrade,
            runs: last,
        }));
        registry.register(Arc::new(Sleeping(Duration::from_secs(5))));
        Arc::new(registry)
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn test_abort_on_first_failure() {
        let (first, last) = counters();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let (ctx, _) = maker_services();

        let (_, outcome) = TaskRunner::new("Pipeline", PIPELINE, registry(first.clone(), last.clone()))
            .on_success(|| panic!("success must not run"))
            .on_failure(move |fault| {
                assert_eq!(fault.task, Some(TaskKind::VerifyPeersAccountAgeWitness));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .run(context(ctx))
            .await;

        assert!(matches!(outcome, RunOutcome::Failed(ref f) if f.reason.contains("witness too young")));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_continuation_runs_once() {
        let (first, last) = counters();
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let (on_success, on_failure) = (successes.clone(), failures.clone());
        let registry = registry(first, last.clone());
        registry.set_intercept(TaskKind::VerifyPeersAccountAgeWitness, Intercept::Skip);
        let (ctx, _) = maker_services();

        let (_, outcome) = TaskRunner::new("Pipeline", PIPELINE, registry)
            .with_timeout(Some(Duration::from_secs(30)))
            .on_success(move || {
                on_success.fetch_add(1, Ordering::SeqCst);
            })
            .on_failure(move |_| {
                on_failure.fetch_add(1, Ordering::SeqCst);
            })
            .run(context(ctx))
            .await;
        assert_eq!(outcome, RunOutcome::Completed);

        // Well past the timeout: the completed run must not fail afterwards
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(last.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_failure_once_and_drops_completion() {
        let (first, last) = counters();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let (ctx, _) = maker_services();

        let (_, outcome) = TaskRunner::new(
            "Slow",
            &[TaskKind::SignDepositTx, TaskKind::CloseTrade],
            registry(first, last.clone()),
        )
        .with_timeout(Some(Duration::from_secs(1)))
        .on_success(|| panic!("late completion must be ignored"))
        .on_failure(move |fault| {
            assert!(fault.timed_out);
            assert!(fault.task.is_none());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .run(context(ctx))
        .await;

        assert_eq!(outcome, RunOutcome::TimedOut);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_intercept_fail_and_missing_task() {
        let (first, last) = counters();
        let registry = registry(first.clone(), last);
        registry.set_intercept(
            TaskKind::ApplyFilter,
            Intercept::Fail {
                reason: "forced".into(),
            },
        );
        let (ctx, _) = maker_services();
        let (_, outcome) = TaskRunner::new("Pipeline", PIPELINE, registry)
            .run(context(ctx))
            .await;
        match outcome {
            RunOutcome::Failed(fault) => {
                assert_eq!(fault.task, Some(TaskKind::ApplyFilter));
                assert!(fault.reason.contains("forced"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);

        let (ctx, _) = maker_services();
        let (_, outcome) = TaskRunner::new(
            "Unregistered",
            &[TaskKind::FundMultisig],
            Arc::new(TaskRegistry::empty()),
        )
        .run(context(ctx))
        .await;
        assert!(matches!(outcome, RunOutcome::Failed(ref f) if f.reason.contains("no registered implementation")));
    }
}
