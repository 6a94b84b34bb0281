//! Iteration loop orchestrator for external coding agents.
//!
//! Reads a prioritized task store, hands one eligible task at a time to an
//! agent CLI (amp, claude, codex, opencode) and records the outcome until the
//! tasks are done or a limit is hit.

use std::env;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use ralph::core::budget::BudgetGuardian;
use ralph::core::progress::compute_progress;
use ralph::core::selector::{dangling_blockers, unresolved_blockers};
use ralph::error::RalphError;
use ralph::exit_codes;
use ralph::io::config::{RalphConfig, load_config};
use ralph::io::executor::{Tool, build_executor};
use ralph::io::init::{InitOptions, RalphPaths, discover_root, init_project};
use ralph::io::prompt::{load_base_prompt, prompt_path};
use ralph::io::task_store::{FileTaskStore, TaskStore};
use ralph::logging;
use ralph::looping::{LoopConfig, StopFlag, logging_escalation_callback, run_loop};
use ralph::select::{SelectOutcome, select_from_store, select_task};
use ralph::step::StepConfig;
use ralph::task::TaskStatus;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Iteration loop orchestrator for external coding agents"
)]
struct Cli {
    /// Project root. Defaults to the nearest ancestor containing `.git`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Debug-level diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through eligible tasks with an agent until done or a limit is hit.
    Run(RunArgs),
    /// Print the id of the task the loop would pick next.
    Select {
        /// Check this task instead of picking by priority.
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Summarize task progress.
    Status,
    /// List tasks in store order.
    ListTasks {
        #[arg(long, value_enum, default_value_t = StatusFilter::All)]
        filter: StatusFilter,
    },
    /// Create `.ralph/config.toml` and an empty task store if missing.
    Init {
        /// Overwrite existing ralph files. The task store is never overwritten.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Agent CLI to drive.
    #[arg(long, visible_alias = "agent", value_enum)]
    tool: Tool,

    /// Stop after this many iterations.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Work only on this task.
    #[arg(long)]
    task_id: Option<String>,

    /// Report what would run and exit.
    #[arg(long)]
    dry_run: bool,

    /// Enable the budget guardian.
    #[arg(long)]
    budget: bool,

    /// Kill an agent process after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StatusFilter {
    All,
    Pending,
    InProgress,
    Done,
}

impl StatusFilter {
    fn matches(self, status: TaskStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Pending => status == TaskStatus::Pending,
            StatusFilter::InProgress => status == TaskStatus::InProgress,
            StatusFilter::Done => status == TaskStatus::Done,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let loop_command = matches!(cli.command, Command::Run(_));
    logging::init(logging::default_directive(cli.verbose, loop_command));

    let root = match cli.root {
        Some(root) => root,
        None => discover_root(&env::current_dir().context("read current directory")?),
    };
    match cli.command {
        Command::Run(args) => cmd_run(&root, args),
        Command::Select { task_id } => cmd_select(&root, task_id.as_deref()),
        Command::Status => cmd_status(&root),
        Command::ListTasks { filter } => cmd_list_tasks(&root, filter),
        Command::Init { force } => cmd_init(&root, force),
    }
}

/// Fatal taxonomy errors carry their own exit code; everything else is INVALID.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let ralph_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<RalphError>());
    match ralph_err {
        Some(RalphError::ToolNotAvailable { .. }) => exit_codes::TOOL_NOT_AVAILABLE,
        Some(RalphError::StoreCorrupt { .. }) => exit_codes::STORE_CORRUPT,
        _ => exit_codes::INVALID,
    }
}

/// Config file, then environment, then validation.
fn load_settings(root: &Path) -> Result<(RalphConfig, RalphPaths)> {
    let paths = RalphPaths::new(root);
    let mut config = load_config(&paths.config_path)?;
    config.apply_env_overrides(|key| env::var(key).ok())?;
    config.validate()?;
    let paths = paths.with_config(&config);
    Ok((config, paths))
}

fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let (mut config, paths) = load_settings(root)?;
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        config.iteration_timeout_secs = timeout_secs;
    }
    if args.budget {
        config.budget.enabled = true;
    }
    config.validate()?;

    let store = FileTaskStore::new(&paths.tasks_path);
    let tool_config = config.tools.get(args.tool);
    let executor = build_executor(args.tool, tool_config)?;

    if args.dry_run {
        let outcome = select_from_store(&store, args.task_id.as_deref(), config.blockers)?;
        println!("Dry run: nothing will be executed");
        println!("Tool: {}", args.tool);
        println!("Max iterations: {}", config.max_iterations);
        println!("Timeout: {}s", config.iteration_timeout_secs);
        if config.budget.enabled {
            println!(
                "Budget: {} attempts, {:.2} limit, {:.2} per attempt",
                config.budget.max_attempts,
                config.budget.budget_limit,
                config.budget.cost_per_attempt
            );
        }
        print_selection(&outcome);
        return Ok(outcome.exit_code());
    }

    executor.ensure_available()?;
    let base_prompt = load_base_prompt(&prompt_path(root, args.tool, tool_config))?;

    let run_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let mut step = StepConfig::new(root, run_id);
    step.base_prompt = base_prompt;
    step.timeout = Duration::from_secs(config.iteration_timeout_secs);
    step.output_limit_bytes = config.output_limit_bytes;
    step.on_failure = config.on_failure;
    step.echo = true;
    step.iterations_dir = Some(paths.iterations_dir.clone());

    let mut loop_config = LoopConfig::new(step, config.max_iterations);
    loop_config.target = args.task_id;
    loop_config.blockers = config.blockers;
    loop_config.iteration_delay = Duration::from_millis(config.iteration_delay_ms);
    loop_config.progress_path = Some(paths.progress_path.clone());

    let mut guardian = config.budget.enabled.then(|| {
        BudgetGuardian::new(config.budget.clone())
            .with_escalation_callback(logging_escalation_callback())
    });

    let stop_flag = StopFlag::new();
    install_interrupt_handler(stop_flag.clone())?;

    info!(tool = %args.tool, max_iterations = config.max_iterations, "starting ralph");
    let outcome = run_loop(
        &store,
        executor.as_ref(),
        guardian.as_mut(),
        &loop_config,
        &stop_flag,
        |step| println!("{}", step.summary_line()),
    )?;

    if let Some(budget) = &outcome.budget {
        println!("{budget}");
    }
    println!(
        "Stopped after {} iteration(s): {}",
        outcome.iterations,
        outcome.stop.describe()
    );
    println!("See {} for details.", paths.progress_path.display());
    Ok(outcome.stop.exit_code())
}

/// Request a stop on SIGINT. The loop finishes the current attempt first.
fn install_interrupt_handler(stop_flag: StopFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("ralph-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupt received; stopping after the current iteration");
                        stop_flag.request_stop();
                    }
                    Err(err) => warn!(err = %err, "cannot listen for interrupts"),
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

fn cmd_select(root: &Path, task_id: Option<&str>) -> Result<i32> {
    let (config, paths) = load_settings(root)?;
    let store = FileTaskStore::new(&paths.tasks_path);
    let outcome = select_from_store(&store, task_id, config.blockers)?;
    match &outcome {
        SelectOutcome::Selected(task) => println!("{}", task.id),
        other => print_selection(other),
    }
    Ok(outcome.exit_code())
}

fn print_selection(outcome: &SelectOutcome) {
    match outcome {
        SelectOutcome::Selected(task) => println!(
            "Next task: [{}] {} (priority {})",
            task.id, task.title, task.priority
        ),
        SelectOutcome::Complete => println!("All tasks complete"),
        SelectOutcome::NoEligible { open } if open.is_empty() => println!("No tasks"),
        SelectOutcome::NoEligible { open } => {
            println!("No eligible task; open tasks: {}", open.join(", "));
        }
        SelectOutcome::TargetUnavailable(err) => println!("Target unavailable: {err}"),
    }
}

fn cmd_status(root: &Path) -> Result<i32> {
    let (config, paths) = load_settings(root)?;
    let doc = FileTaskStore::new(&paths.tasks_path).load()?;
    let stats = compute_progress(&doc.tasks, config.blockers);

    println!(
        "Project: {}",
        doc.metadata.project.as_deref().unwrap_or("(unnamed)")
    );
    if let Some(branch) = &doc.metadata.branch_name {
        println!("Branch: {branch}");
    }
    println!("{}", "=".repeat(50));
    println!(
        "Total Tasks: {} ({:.1}% complete)",
        stats.total, stats.percent_complete
    );
    println!(
        "Completed: {} | In Progress: {} | Pending: {} | Blocked: {}",
        stats.done, stats.in_progress, stats.pending, stats.blocked
    );
    println!("{}", "=".repeat(50));

    let dangling = dangling_blockers(&doc.tasks);
    if !dangling.is_empty() {
        println!("Unknown blockers:");
        for blocker in dangling {
            println!("  {} is blocked by missing task {}", blocker.task_id, blocker.missing);
        }
    }
    match select_task(&doc, None, config.blockers) {
        SelectOutcome::Selected(task) => println!("Next: [{}] {}", task.id, task.title),
        SelectOutcome::Complete => println!("All tasks complete"),
        _ => {}
    }
    Ok(exit_codes::OK)
}

fn cmd_list_tasks(root: &Path, filter: StatusFilter) -> Result<i32> {
    let (config, paths) = load_settings(root)?;
    let doc = FileTaskStore::new(&paths.tasks_path).load()?;

    println!("{:<15} {:<13} {:<10} TITLE", "ID", "STATUS", "PRIORITY");
    println!("{}", "=".repeat(80));
    for task in doc.tasks.iter().filter(|task| filter.matches(task.status)) {
        let blockers = if task.status == TaskStatus::Pending {
            unresolved_blockers(task, &doc.tasks, config.blockers)
        } else {
            Vec::new()
        };
        let blocked = if blockers.is_empty() {
            String::new()
        } else {
            format!(" (blocked by: {})", blockers.join(", "))
        };
        println!(
            "{:<15} {:<13} {:<10} {}{blocked}",
            task.id,
            task.status.as_str(),
            task.priority,
            task.title
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("Initialized ralph in {}", paths.ralph_dir.display());
    println!("Task store: {}", paths.tasks_path.display());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "ralph",
            "run",
            "--tool",
            "opencode",
            "--max-iterations",
            "3",
            "--task-id",
            "t-1",
            "--budget",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.tool, Tool::OpenCode);
        assert_eq!(args.max_iterations, Some(3));
        assert_eq!(args.task_id.as_deref(), Some("t-1"));
        assert!(args.budget);
        assert!(!args.dry_run);
    }

    #[test]
    fn parse_agent_alias_and_global_flags() {
        let cli = Cli::parse_from([
            "ralph", "run", "--agent", "codex", "--verbose", "--root", "/tmp/x",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(
            cli.command,
            Command::Run(RunArgs {
                tool: Tool::Codex,
                ..
            })
        ));
    }

    #[test]
    fn parse_list_tasks_filter() {
        let cli = Cli::parse_from(["ralph", "list-tasks", "--filter", "in-progress"]);
        assert!(matches!(
            cli.command,
            Command::ListTasks {
                filter: StatusFilter::InProgress
            }
        ));
        assert!(StatusFilter::InProgress.matches(TaskStatus::InProgress));
        assert!(!StatusFilter::Done.matches(TaskStatus::Pending));
    }

    #[test]
    fn run_requires_tool() {
        assert!(Cli::try_parse_from(["ralph", "run"]).is_err());
    }

    #[test]
    fn fatal_errors_map_to_exit_codes() {
        let err = anyhow::Error::new(RalphError::ToolNotAvailable {
            tool: "amp".to_string(),
            binary: "amp".to_string(),
        })
        .context("start loop");
        assert_eq!(exit_code_for(&err), exit_codes::TOOL_NOT_AVAILABLE);

        let err = anyhow::Error::new(RalphError::StoreCorrupt {
            path: PathBuf::from("tasks.json"),
            detail: "invalid JSON".to_string(),
        });
        assert_eq!(exit_code_for(&err), exit_codes::STORE_CORRUPT);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), exit_codes::INVALID);
    }
}
