//! Multi-iteration loop for `ralph run`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::budget::{
    BudgetExceeded, BudgetGuardian, BudgetState, BudgetSummary, EscalationCallback,
    EscalationLevel,
};
use crate::core::classifier::AttemptVerdict;
use crate::core::selector::{BlockerPolicy, dangling_blockers};
use crate::core::state_update::{FailurePolicy, reset_stale_in_progress};
use crate::error::RalphError;
use crate::exit_codes;
use crate::io::executor::AgentExecutor;
use crate::io::progress_log::ProgressLog;
use crate::io::task_store::TaskStore;
use crate::select::{SelectOutcome, select_task};
use crate::step::{StepConfig, StepOutcome, run_step, timestamp};
use crate::task::TaskDocument;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// Every task is done (or the explicit target already was).
    Complete,
    /// The agent printed the completion marker on a clean exit.
    CompletionSignaled { remaining: usize },
    /// The guardian denied the next attempt.
    BudgetExceeded(BudgetExceeded),
    /// The iteration cap was reached, regardless of task state.
    MaxIterations { iterations: u32 },
    /// Open tasks remain but none can be selected. Empty when there are no tasks.
    NoEligibleTask { open: Vec<String> },
    /// The explicit target is missing, blocked or already in progress.
    TargetUnavailable(RalphError),
    /// A failed task was left `in-progress` under the hold policy.
    Held { task_id: String },
    /// The operator asked to stop.
    Interrupted,
}

impl LoopStop {
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopStop::Complete | LoopStop::CompletionSignaled { .. } => exit_codes::OK,
            LoopStop::MaxIterations { .. } => exit_codes::MAX_ITERATIONS,
            LoopStop::NoEligibleTask { .. } => exit_codes::NO_ELIGIBLE_TASK,
            LoopStop::BudgetExceeded(_) => exit_codes::BUDGET_EXCEEDED,
            LoopStop::TargetUnavailable(_) => exit_codes::TARGET_UNAVAILABLE,
            LoopStop::Held { .. } => exit_codes::TASK_HELD,
            LoopStop::Interrupted => exit_codes::INTERRUPTED,
        }
    }

    /// Human-readable stop reason.
    pub fn describe(&self) -> String {
        match self {
            LoopStop::Complete => "all tasks complete".to_string(),
            LoopStop::CompletionSignaled { remaining: 0 } => {
                "completion signal received; all tasks complete".to_string()
            }
            LoopStop::CompletionSignaled { remaining } => {
                format!("completion signal received; {remaining} task(s) not done")
            }
            LoopStop::BudgetExceeded(denied) => format!("budget exceeded: {denied}"),
            LoopStop::MaxIterations { iterations } => {
                format!("reached max iterations ({iterations}) before all tasks were done")
            }
            LoopStop::NoEligibleTask { open } if open.is_empty() => "no tasks".to_string(),
            LoopStop::NoEligibleTask { open } => format!(
                "no eligible task; open tasks are blocked or held: {}",
                open.join(", ")
            ),
            LoopStop::TargetUnavailable(err) => format!("target unavailable: {err}"),
            LoopStop::Held { task_id } => {
                format!("task {task_id} failed and is held in-progress; fix it and rerun")
            }
            LoopStop::Interrupted => "interrupted".to_string(),
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Attempts dispatched to the agent.
    pub iterations: u32,
    pub stop: LoopStop,
    /// Final budget report, when the guardian was enabled.
    pub budget: Option<BudgetSummary>,
}

/// Loop-wide settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub step: StepConfig,
    pub max_iterations: u32,
    /// Work only on this task id, ignoring priority.
    pub target: Option<String>,
    pub blockers: BlockerPolicy,
    pub iteration_delay: Duration,
    /// Progress log path. `None` disables it.
    pub progress_path: Option<PathBuf>,
}

impl LoopConfig {
    pub fn new(step: StepConfig, max_iterations: u32) -> Self {
        Self {
            step,
            max_iterations,
            target: None,
            blockers: BlockerPolicy::default(),
            iteration_delay: Duration::ZERO,
            progress_path: None,
        }
    }
}

/// Cooperative stop request shared with the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Escalation callback that reports level changes through `tracing`.
pub fn logging_escalation_callback() -> EscalationCallback {
    Box::new(|level: EscalationLevel, state: &BudgetState| match level {
        EscalationLevel::Normal => info!(attempts = state.attempts, "budget level back to NORMAL"),
        EscalationLevel::Warning | EscalationLevel::Critical => warn!(
            attempts = state.attempts,
            cost = state.total_cost,
            "budget level is now {level}"
        ),
        EscalationLevel::Exceeded => error!(
            attempts = state.attempts,
            cost = state.total_cost,
            "budget level is now {level}"
        ),
    })
}

/// Run attempts until a terminal state is reached.
///
/// Stops with an error only when the store cannot be read or written or the
/// agent cannot be launched; every other outcome is a [`LoopStop`].
#[instrument(skip_all, fields(run_id = %config.step.run_id, max_iterations = config.max_iterations))]
pub fn run_loop<S, E, F>(
    store: &S,
    executor: &E,
    mut guardian: Option<&mut BudgetGuardian>,
    config: &LoopConfig,
    stop_flag: &StopFlag,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    S: TaskStore + ?Sized,
    E: AgentExecutor + ?Sized,
    F: FnMut(&StepOutcome),
{
    let progress = config.progress_path.as_ref().map(ProgressLog::new);
    let mut doc = store.load()?;
    prepare(store, &mut doc)?;
    if let Some(log) = &progress {
        log.append(
            &timestamp(),
            &format!(
                "run {} started with {} (max {} iterations)",
                config.step.run_id,
                executor.tool(),
                config.max_iterations
            ),
        )?;
    }

    let mut iterations = 0u32;
    let stop = loop {
        if stop_flag.is_stop_requested() {
            break LoopStop::Interrupted;
        }

        let task_id = match select(&doc, config) {
            Ok(id) => id,
            Err(stop) => break stop,
        };

        let attempt = match guardian.as_deref_mut() {
            Some(guardian) => match guardian.authorize_attempt() {
                Ok(record) => Some(record),
                Err(denied) => break LoopStop::BudgetExceeded(denied),
            },
            None => None,
        };

        iterations += 1;
        info!(iter = iterations, task_id = %task_id, "starting iteration");
        let step = run_step(
            store,
            &mut doc,
            &task_id,
            executor,
            attempt,
            iterations,
            &config.step,
        )?;

        if let Some(guardian) = guardian.as_deref_mut() {
            match &step.verdict {
                AttemptVerdict::Complete | AttemptVerdict::Succeeded => guardian.record_success(),
                AttemptVerdict::Failed(err) => guardian.record_failure(&err.to_string()),
            }
        }
        if let Some(log) = &progress {
            log.append(&timestamp(), &step.summary_line())?;
        }
        on_step(&step);

        if step.verdict == AttemptVerdict::Complete {
            let remaining = doc.tasks.iter().filter(|task| !task.is_done()).count();
            break LoopStop::CompletionSignaled { remaining };
        }
        // Dispatching another task now would leave two of them in progress.
        if matches!(step.verdict, AttemptVerdict::Failed(_))
            && config.step.on_failure == FailurePolicy::Hold
        {
            break LoopStop::Held { task_id };
        }
        if iterations >= config.max_iterations {
            break LoopStop::MaxIterations { iterations };
        }
        pause(config.iteration_delay, stop_flag);
    };

    info!(iterations, reason = %stop.describe(), "loop stopped");
    if let Some(log) = &progress {
        log.append(&timestamp(), &format!("stopped: {}", stop.describe()))?;
    }
    Ok(LoopOutcome {
        run_id: config.step.run_id.clone(),
        iterations,
        stop,
        budget: guardian.map(|guardian| guardian.summary()),
    })
}

/// Reset tasks stranded `in-progress` and report dangling blockers.
fn prepare<S: TaskStore + ?Sized>(store: &S, doc: &mut TaskDocument) -> Result<()> {
    let reset = reset_stale_in_progress(doc, &timestamp());
    if !reset.is_empty() {
        warn!(tasks = %reset.join(", "), "reset stale in-progress tasks to pending");
        store.save(doc)?;
    }
    for dangling in dangling_blockers(&doc.tasks) {
        warn!(
            task_id = %dangling.task_id,
            missing = %dangling.missing,
            "task is blocked by an unknown task and can never be selected"
        );
    }
    Ok(())
}

fn select(doc: &TaskDocument, config: &LoopConfig) -> std::result::Result<String, LoopStop> {
    match select_task(doc, config.target.as_deref(), config.blockers) {
        SelectOutcome::Selected(task) => Ok(task.id),
        SelectOutcome::Complete => Err(LoopStop::Complete),
        SelectOutcome::NoEligible { open } => Err(LoopStop::NoEligibleTask { open }),
        SelectOutcome::TargetUnavailable(err) => Err(LoopStop::TargetUnavailable(err)),
    }
}

/// Sleep for `delay`, waking early when a stop is requested.
fn pause(delay: Duration, stop_flag: &StopFlag) {
    let deadline = Instant::now() + delay;
    while !stop_flag.is_stop_requested() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetConfig;
    use crate::error::IneligibleReason;
    use crate::task::TaskStatus;
    use crate::test_support::{
        ScriptedExecutor, ScriptedRun, TestProject, blocked_task, task, task_with_status,
    };

    fn loop_config(project: &TestProject, max_iterations: u32) -> LoopConfig {
        LoopConfig::new(StepConfig::new(project.root(), "run-1"), max_iterations)
    }

    #[test]
    fn empty_store_stops_with_no_tasks() {
        let project = TestProject::new().expect("project");
        let executor = ScriptedExecutor::new(Vec::new());

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 5),
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::NoEligibleTask { open: Vec::new() });
        assert_eq!(outcome.stop.describe(), "no tasks");
        assert_eq!(outcome.iterations, 0);
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn all_done_store_is_complete_without_attempts() {
        let project =
            TestProject::with_tasks(vec![task_with_status("t-1", 0, TaskStatus::Done)])
                .expect("project");
        let executor = ScriptedExecutor::new(Vec::new());
        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 5),
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
    }

    #[test]
    fn works_tasks_in_priority_order_until_complete() {
        let project = TestProject::with_tasks(vec![task("low", 5), task("high", 1)])
            .expect("project");
        let executor = ScriptedExecutor::repeating(ScriptedRun::success("ok"), 2);
        let mut seen = Vec::new();

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 10),
            &StopFlag::new(),
            |step| seen.push(step.task_id.clone()),
        )
        .expect("loop");

        assert_eq!(seen, vec!["high", "low"]);
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.iterations, 2);
    }

    #[test]
    fn failed_attempt_is_retried_on_next_iteration() {
        let project = TestProject::with_tasks(vec![task("t-1", 0)]).expect("project");
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::failure(1, "compile error"),
            ScriptedRun::success("fixed"),
        ]);

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 10),
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(executor.calls(), 2);
        let doc = project.read_tasks().expect("read");
        assert_eq!(doc.find("t-1").expect("task").notes.len(), 2);
    }

    #[test]
    fn stale_in_progress_task_is_reset_and_retried() {
        let project =
            TestProject::with_tasks(vec![task_with_status("t-1", 0, TaskStatus::InProgress)])
                .expect("project");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success("ok")]);

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 3),
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        let doc = project.read_tasks().expect("read");
        let notes = &doc.find("t-1").expect("task").notes;
        assert!(notes[0].contains("reset to pending"));
    }

    #[test]
    fn budget_denial_stops_before_dispatch() {
        let project = TestProject::with_tasks(vec![task("t-1", 0)]).expect("project");
        let executor = ScriptedExecutor::repeating(ScriptedRun::failure(1, "nope"), 5);
        let mut guardian = BudgetGuardian::new(BudgetConfig {
            enabled: true,
            max_attempts: 2,
            budget_limit: 1_000.0,
            cost_per_attempt: 1.0,
            ..BudgetConfig::default()
        });

        let outcome = run_loop(
            &project.store(),
            &executor,
            Some(&mut guardian),
            &loop_config(&project, 10),
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");

        assert!(matches!(outcome.stop, LoopStop::BudgetExceeded(_)));
        assert_eq!(outcome.stop.exit_code(), exit_codes::BUDGET_EXCEEDED);
        assert_eq!(executor.calls(), 2);
        let budget = outcome.budget.expect("budget summary");
        assert_eq!(budget.attempts_used, 2);
        assert_eq!(budget.failures, 2);
        assert_eq!(project.status_of("t-1").expect("status"), TaskStatus::Pending);
    }

    #[test]
    fn target_selection_outcomes() {
        let project = TestProject::with_tasks(vec![
            task("first", 0),
            task("second", 9),
            task_with_status("finished", 0, TaskStatus::Done),
            blocked_task("stuck", 0, &["first"]),
        ])
        .expect("project");

        let executor = ScriptedExecutor::new(vec![ScriptedRun::success("ok")]);
        let mut config = loop_config(&project, 5);
        config.target = Some("second".to_string());
        let mut seen = Vec::new();
        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &config,
            &StopFlag::new(),
            |step| seen.push(step.task_id.clone()),
        )
        .expect("loop");
        assert_eq!(seen, vec!["second"]);
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(project.status_of("first").expect("status"), TaskStatus::Pending);

        config.target = Some("stuck".to_string());
        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &config,
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");
        assert!(matches!(
            outcome.stop,
            LoopStop::TargetUnavailable(RalphError::TaskNotEligible {
                reason: IneligibleReason::Blocked(_),
                ..
            })
        ));

        config.target = Some("ghost".to_string());
        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &config,
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop.exit_code(), exit_codes::TARGET_UNAVAILABLE);
    }

    #[test]
    fn stop_flag_is_honored_before_first_attempt() {
        let project = TestProject::with_tasks(vec![task("t-1", 0)]).expect("project");
        let executor = ScriptedExecutor::new(Vec::new());
        let stop = StopFlag::new();
        stop.request_stop();

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 5),
            &stop,
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(outcome.stop.exit_code(), exit_codes::INTERRUPTED);
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn stop_requested_mid_run_ends_after_current_attempt() {
        let project = TestProject::with_tasks(vec![task("a", 0), task("b", 1)]).expect("project");
        let executor = ScriptedExecutor::repeating(ScriptedRun::success("ok"), 2);
        let stop = StopFlag::new();
        let mut config = loop_config(&project, 5);
        config.iteration_delay = Duration::from_secs(60);

        let outcome = run_loop(
            &project.store(),
            &executor,
            None,
            &config,
            &stop,
            |_| stop.request_stop(),
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(project.status_of("b").expect("status"), TaskStatus::Pending);
    }

    #[test]
    fn progress_log_records_iterations_and_stop() {
        let project = TestProject::with_tasks(vec![task("t-1", 0)]).expect("project");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::complete()]);
        let mut config = loop_config(&project, 5);
        config.progress_path = Some(project.paths().progress_path);

        run_loop(
            &project.store(),
            &executor,
            None,
            &config,
            &StopFlag::new(),
            |_| {},
        )
        .expect("loop");

        let log = std::fs::read_to_string(project.paths().progress_path).expect("read");
        assert!(log.starts_with("# Ralph Progress Log\n"));
        assert!(log.contains("iteration 1: t-1 done, completion signal received"));
        assert!(log.contains("stopped: completion signal received; all tasks complete"));
    }

    #[test]
    fn unavailable_agent_aborts_and_reverts_task() {
        let project = TestProject::with_tasks(vec![task("t-1", 0)]).expect("project");
        let executor = ScriptedExecutor::unavailable();

        let err = run_loop(
            &project.store(),
            &executor,
            None,
            &loop_config(&project, 5),
            &StopFlag::new(),
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RalphError>(),
            Some(RalphError::ToolNotAvailable { .. })
        ));
        assert_eq!(executor.remaining(), 0);
        assert_eq!(project.status_of("t-1").expect("status"), TaskStatus::Pending);
    }
}
