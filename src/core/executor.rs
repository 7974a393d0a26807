//! DC-008: Scheduler. Runs a recipe tier by tier, in sequential or parallel mode.
//!
//! Tiers run in ascending priority; a failed or interrupted tier stops the
//! recipe. Every step whose `init` succeeded gets exactly one of `finish` or
//! `cancel`:
//!
//! - sequential tier: successful steps are held open and finished together
//!   once the whole tier succeeded; on the first failure every held step
//!   (and the failing one) is cancelled and the rest of the tier never runs.
//! - parallel tier: one worker and one watchdog task per step. The worker
//!   drives `init → to_skip → execute` and reports on a oneshot channel; the
//!   watchdog owns the terminal hook and only calls it after the worker has
//!   reported.

use super::error::Error;
use super::recipe::Recipe;
use super::step::{StepContext, StepHandle};
use super::types::{RunMode, StepKind};
use crate::journal::eventlog::Journal;
use crate::journal::RunEvent;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

// ============================================================================
// Reports
// ============================================================================

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Executed and finished
    Finished,
    /// Skip predicate held; finished without executing
    Skipped,
    /// Rolled back after a tier failure or interruption
    Cancelled,
    /// `to_skip` or `execute` failed; cancelled
    Errored,
    /// `init` failed; no terminal hook
    InitFailed,
    /// `finish` failed
    FinishFailed,
}

impl StepStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Errored | Self::InitFailed | Self::FinishFailed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Finished => "finished",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
            Self::InitFailed => "init-failed",
            Self::FinishFailed => "finish-failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub kind: StepKind,
    pub priority: i32,
    pub status: StepStatus,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Outcome of one recipe.
#[derive(Debug, Clone, Default)]
pub struct RecipeReport {
    pub recipe: String,
    pub tiers_entered: usize,
    pub steps: Vec<StepReport>,
    pub interrupted: bool,
    /// Recipe-level failure outside any step (crashed task)
    pub error: Option<String>,
    pub duration: Duration,
}

impl RecipeReport {
    pub fn failed(&self) -> bool {
        self.interrupted
            || self.error.is_some()
            || self.steps.iter().any(|s| s.status.is_failure())
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_failure()).count()
    }
}

/// Outcome of a cookbook run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub recipes: Vec<RecipeReport>,
    pub duration: Duration,
}

impl RunReport {
    /// True iff any step failed or any recipe was interrupted.
    pub fn failed(&self) -> bool {
        self.recipes.iter().any(RecipeReport::failed)
    }

    pub fn recipe(&self, name: &str) -> Option<&RecipeReport> {
        self.recipes.iter().find(|r| r.recipe == name)
    }

    /// Status of a step by recipe and step name.
    pub fn status(&self, recipe: &str, step: &str) -> Option<StepStatus> {
        self.recipe(recipe)?
            .steps
            .iter()
            .find(|s| s.name == step)
            .map(|s| s.status)
    }
}

// ============================================================================
// Step driving
// ============================================================================

/// How far a step got before its terminal hook.
#[derive(Debug)]
enum Completion {
    InitFailed(Error),
    Errored(Error),
    Skipped,
    Done,
    /// Initialized, but the tier was cancelled before it did anything
    Aborted,
}

/// `init`, then (unless the tier is already cancelled) `to_skip` and
/// `execute`. Never calls a terminal hook.
async fn drive(handle: &StepHandle, ctx: &StepContext) -> Completion {
    let mut step = handle.lock().await;

    if let Err(e) = step.init(ctx).await {
        return Completion::InitFailed(e);
    }
    if ctx.is_cancelled() {
        return Completion::Aborted;
    }
    match step.to_skip(ctx).await {
        Ok(true) => return Completion::Skipped,
        Ok(false) => {}
        Err(e) => return Completion::Errored(e),
    }
    match step.execute(ctx).await {
        Ok(()) => Completion::Done,
        Err(e) => Completion::Errored(e),
    }
}

/// First failure of a tier. Setting it cancels the tier.
#[derive(Debug)]
struct TierFailure {
    first: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl TierFailure {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            first: Mutex::new(None),
            cancel,
        }
    }

    fn record(&self, step: &str, error: &Error) {
        let mut first = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(format!("{}: {}", step, error));
        }
        self.cancel.cancel();
    }

    fn first(&self) -> Option<String> {
        self.first.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Call the terminal hook for a completion and build the step report.
/// `cancelled` forces `cancel` even for a completed step.
async fn terminate(
    handle: &StepHandle,
    ctx: &StepContext,
    priority: i32,
    completion: Completion,
    cancelled: bool,
    started: Instant,
) -> StepReport {
    let (status, error) = match completion {
        Completion::InitFailed(e) => {
            tracing::error!(parent: &ctx.span, error = %e, "init failed");
            (StepStatus::InitFailed, Some(e.to_string()))
        }
        Completion::Errored(e) => {
            tracing::error!(parent: &ctx.span, error = %e, "step failed");
            handle.lock().await.cancel(ctx).await;
            (StepStatus::Errored, Some(e.to_string()))
        }
        Completion::Aborted => {
            handle.lock().await.cancel(ctx).await;
            (StepStatus::Cancelled, None)
        }
        Completion::Done | Completion::Skipped if cancelled => {
            handle.lock().await.cancel(ctx).await;
            (StepStatus::Cancelled, None)
        }
        done => {
            let status = if matches!(done, Completion::Skipped) {
                StepStatus::Skipped
            } else {
                StepStatus::Finished
            };
            match handle.lock().await.finish(ctx).await {
                Ok(()) => (status, None),
                Err(e) => {
                    tracing::error!(parent: &ctx.span, error = %e, "finish failed");
                    (StepStatus::FinishFailed, Some(e.to_string()))
                }
            }
        }
    };

    tracing::debug!(parent: &ctx.span, %status, "step terminal");
    StepReport {
        name: handle.name().to_string(),
        kind: handle.kind(),
        priority,
        status,
        error,
        duration: started.elapsed(),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs recipes with one mode and an optional journal.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    pub mode: RunMode,
    pub journal: Option<Journal>,
}

impl Scheduler {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Option<Journal>) -> Self {
        self.journal = journal;
        self
    }

    /// Run every tier of a recipe. The recipe gets a child of `root`.
    pub async fn run_recipe(&self, recipe: &Recipe, root: &CancellationToken) -> RecipeReport {
        let start = Instant::now();
        let recipe_cancel = root.child_token();
        let span = tracing::info_span!("recipe", recipe = %recipe.name);
        let mut report = RecipeReport {
            recipe: recipe.name.clone(),
            ..Default::default()
        };

        self.journal_event(
            recipe,
            RunEvent::RunStarted {
                recipe: recipe.name.clone(),
                run_id: self.run_id(),
                dbchef_version: env!("CARGO_PKG_VERSION").to_string(),
                mode: self.mode.to_string(),
            },
        )
        .await;
        tracing::info!(parent: &span, mode = %self.mode, steps = recipe.step_count(), "recipe started");

        for (priority, steps) in recipe.tiers() {
            if recipe_cancel.is_cancelled() {
                break;
            }
            report.tiers_entered += 1;
            let tier_cancel = recipe_cancel.child_token();
            let tier_span = tracing::info_span!(parent: &span, "tier", priority);

            let (reports, failure) = match self.mode {
                RunMode::Sequential => {
                    run_sequential(recipe, priority, steps, &tier_cancel, &tier_span).await
                }
                RunMode::Parallel => {
                    run_parallel(recipe, priority, steps, &tier_cancel, &tier_span).await
                }
            };

            for step in &reports {
                self.journal_step(recipe, step).await;
            }
            let failed = reports.iter().any(|s| s.status.is_failure());
            report.steps.extend(reports);

            if failed {
                tracing::error!(
                    parent: &tier_span,
                    first_failure = failure.as_deref().unwrap_or("unknown"),
                    "tier failed, later tiers skipped"
                );
                break;
            }
        }

        report.interrupted = recipe_cancel.is_cancelled();
        if report.interrupted {
            tracing::warn!(parent: &span, "recipe interrupted");
        }
        report.duration = start.elapsed();

        self.journal_event(
            recipe,
            RunEvent::RunCompleted {
                recipe: recipe.name.clone(),
                run_id: self.run_id(),
                steps_finished: count_u32(&report, StepStatus::Finished),
                steps_skipped: count_u32(&report, StepStatus::Skipped),
                steps_cancelled: count_u32(&report, StepStatus::Cancelled),
                steps_failed: u32::try_from(report.failures()).unwrap_or(u32::MAX),
                interrupted: report.interrupted,
                total_seconds: report.duration.as_secs_f64(),
            },
        )
        .await;
        tracing::info!(
            parent: &span,
            failed = report.failed(),
            tiers = report.tiers_entered,
            elapsed_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "recipe completed"
        );
        report
    }

    fn run_id(&self) -> String {
        self.journal
            .as_ref()
            .map(|j| j.run_id().to_string())
            .unwrap_or_default()
    }

    async fn journal_event(&self, recipe: &Recipe, event: RunEvent) {
        if let Some(journal) = &self.journal {
            journal.record(&recipe.name, event).await;
        }
    }

    async fn journal_step(&self, recipe: &Recipe, step: &StepReport) {
        let name = recipe.name.clone();
        let event = match step.status {
            StepStatus::Finished => RunEvent::StepFinished {
                recipe: name,
                step: step.name.clone(),
                priority: step.priority,
                duration_seconds: step.duration.as_secs_f64(),
            },
            StepStatus::Skipped => RunEvent::StepSkipped {
                recipe: name,
                step: step.name.clone(),
                priority: step.priority,
            },
            StepStatus::Cancelled => RunEvent::StepCancelled {
                recipe: name,
                step: step.name.clone(),
                priority: step.priority,
            },
            StepStatus::Errored | StepStatus::InitFailed | StepStatus::FinishFailed => {
                RunEvent::StepFailed {
                    recipe: name,
                    step: step.name.clone(),
                    priority: step.priority,
                    stage: step.status.to_string(),
                    error: step.error.clone().unwrap_or_default(),
                }
            }
        };
        self.journal_event(recipe, event).await;
    }
}

fn count_u32(report: &RecipeReport, status: StepStatus) -> u32 {
    u32::try_from(report.count(status)).unwrap_or(u32::MAX)
}

fn step_context(
    recipe: &Recipe,
    handle: &StepHandle,
    cancel: &CancellationToken,
    tier_span: &tracing::Span,
) -> StepContext {
    let span = tracing::info_span!(
        parent: tier_span,
        "step",
        step = %handle.name(),
        kind = %handle.kind()
    );
    StepContext::new(&recipe.name, handle.name(), span, cancel.clone())
}

/// Steps in load order. Successful steps stay open until the tier is done.
async fn run_sequential(
    recipe: &Recipe,
    priority: i32,
    steps: &[StepHandle],
    tier_cancel: &CancellationToken,
    tier_span: &tracing::Span,
) -> (Vec<StepReport>, Option<String>) {
    let mut reports = Vec::with_capacity(steps.len());
    let mut held: Vec<(&StepHandle, StepContext, Completion, Instant)> = Vec::new();
    let mut failure: Option<String> = None;

    for handle in steps {
        if tier_cancel.is_cancelled() {
            break;
        }
        let ctx = step_context(recipe, handle, tier_cancel, tier_span);
        let started = Instant::now();
        let completion = drive(handle, &ctx).instrument(ctx.span.clone()).await;

        match completion {
            Completion::InitFailed(e) => {
                failure = Some(format!("{}: {}", handle.name(), e));
                reports.push(
                    terminate(handle, &ctx, priority, Completion::InitFailed(e), false, started)
                        .await,
                );
                break;
            }
            Completion::Errored(e) => {
                failure = Some(format!("{}: {}", handle.name(), e));
                held.push((handle, ctx, Completion::Errored(e), started));
                break;
            }
            other => held.push((handle, ctx, other, started)),
        }
    }

    let abort = failure.is_some() || tier_cancel.is_cancelled();
    if abort {
        // roll back in reverse execution order
        for (handle, ctx, completion, started) in held.into_iter().rev() {
            let report = terminate(handle, &ctx, priority, completion, true, started)
                .instrument(ctx.span.clone())
                .await;
            reports.push(report);
        }
    } else {
        for (handle, ctx, completion, started) in held {
            let report = terminate(handle, &ctx, priority, completion, false, started)
                .instrument(ctx.span.clone())
                .await;
            if report.status == StepStatus::FinishFailed && failure.is_none() {
                failure = Some(format!(
                    "{}: {}",
                    report.name,
                    report.error.as_deref().unwrap_or_default()
                ));
            }
            reports.push(report);
        }
    }

    (reports, failure)
}

/// All steps at once, each with a worker and a watchdog.
async fn run_parallel(
    recipe: &Recipe,
    priority: i32,
    steps: &[StepHandle],
    tier_cancel: &CancellationToken,
    tier_span: &tracing::Span,
) -> (Vec<StepReport>, Option<String>) {
    let failure = Arc::new(TierFailure::new(tier_cancel.clone()));
    let mut workers = Vec::with_capacity(steps.len());
    let mut watchdogs = Vec::with_capacity(steps.len());

    for handle in steps {
        let ctx = Arc::new(step_context(recipe, handle, tier_cancel, tier_span));
        let (done_tx, done_rx) = oneshot::channel::<Completion>();
        let started = Instant::now();

        let worker = {
            let handle = handle.clone();
            let ctx = Arc::clone(&ctx);
            let failure = Arc::clone(&failure);
            let span = ctx.span.clone();
            tokio::spawn(
                async move {
                    let completion = drive(&handle, &ctx).await;
                    if let Completion::InitFailed(e) | Completion::Errored(e) = &completion {
                        failure.record(handle.name(), e);
                    }
                    // receiver only goes away if the watchdog panicked
                    let _ = done_tx.send(completion);
                }
                .instrument(span),
            )
        };

        let watchdog = {
            let handle = handle.clone();
            let tier_cancel = tier_cancel.clone();
            let span = ctx.span.clone();
            tokio::spawn(
                async move {
                    watch(handle, ctx, tier_cancel, done_rx, priority, started).await
                }
                .instrument(span),
            )
        };

        workers.push(worker);
        watchdogs.push((handle.name().to_string(), handle.kind(), watchdog));
    }

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(parent: tier_span, error = %e, "step worker aborted");
        }
    }

    let mut reports = Vec::with_capacity(watchdogs.len());
    for (name, kind, watchdog) in watchdogs {
        let report = match watchdog.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(parent: tier_span, step = %name, error = %e, "watchdog aborted");
                StepReport {
                    name,
                    kind,
                    priority,
                    status: StepStatus::Errored,
                    error: Some(e.to_string()),
                    duration: Duration::ZERO,
                }
            }
        };
        reports.push(report);
    }

    (reports, failure.first())
}

/// Wait for tier cancellation or the worker's completion, whichever comes
/// first, then call exactly one terminal hook after the worker is done.
async fn watch(
    handle: StepHandle,
    ctx: Arc<StepContext>,
    tier_cancel: CancellationToken,
    mut done_rx: oneshot::Receiver<Completion>,
    priority: i32,
    started: Instant,
) -> StepReport {
    let early = tokio::select! {
        biased;
        () = tier_cancel.cancelled() => None,
        c = &mut done_rx => Some(c),
    };

    let (completion, cancelled) = match early {
        Some(c) => (c, false),
        None => (done_rx.await, true),
    };
    // a dropped sender means the worker panicked mid-lifecycle
    let completion = completion
        .unwrap_or_else(|_| Completion::Errored(Error::Command("step worker panicked".into())));

    terminate(&handle, &ctx, priority, completion, cancelled, started).await
}
