//! mend - bounded self-correction for failing verification
//!
//! Runs a verification command and, when it fails, drives a bounded repair
//! loop with an external diff generator and `git apply`.

use clap::{Parser, Subcommand};
use colored::Colorize;
use mend::operations::{
    ApprovalMode, CommandDiffGenerator, CommandTestRunner, GitApplyApplicator,
    TerminalApprovalManager,
};
use mend::repair::{
    classify_failure, generate_decision_options, normalize_output, DecisionContext,
    DecisionOption, EventSink, FanoutEventSink, JsonlEventSink, RepairCapabilities,
    SelfCorrectionRunner, StopEvent, StopReason, TestRunner, TracingEventSink,
};
use mend::{MendConfig, MendError};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Exit code when the repair loop stops without fixing the failure.
const EXIT_STOPPED: i32 = 3;

#[derive(Parser)]
#[command(name = "mend")]
#[command(version = "0.1.0")]
#[command(about = "Bounded self-correction for failing tests, typechecks, lints, and builds", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify verification output and print the result as JSON
    Classify {
        /// File holding the output (reads stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Print verification output with non-semantic noise replaced
    Normalize {
        /// File holding the output (reads stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Run verification and repair failures
    Run {
        /// Verification command (overrides testCommand in config)
        #[arg(short, long)]
        command: Option<String>,

        /// Diff generator command (overrides generatorCommand in config)
        #[arg(short, long)]
        generator: Option<String>,

        /// Path or glob the repair may touch (repeatable)
        #[arg(short, long = "allow", value_name = "PATH")]
        allow: Vec<String>,

        /// Repair budget
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Kill the verification command after this many seconds
        #[arg(long, value_name = "SECS")]
        test_timeout: Option<u64>,

        /// Task identifier used in events
        #[arg(long)]
        task_id: Option<String>,

        /// Approve every scope expansion and test re-run
        #[arg(short, long)]
        yes: bool,

        /// Deny every scope expansion
        #[arg(long, conflicts_with = "yes")]
        deny_scope: bool,

        /// Append repair events to this JSONL file
        #[arg(long, value_name = "FILE")]
        events: Option<PathBuf>,
    },

    /// Print the decision menu for a stop reason
    Options {
        /// Stop reason (e.g. budget_exhausted)
        reason: String,

        /// Remaining repair budget to report
        #[arg(long, default_value = "0")]
        remaining: u32,

        /// Pending out-of-scope file (repeatable)
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<String>,

        /// Print the menu as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "mend=debug,info"
    } else {
        "mend=info,warn"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Classify { file } => {
            let input = read_input(file.as_deref())?;
            let classification = classify_failure(&input);
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        Commands::Normalize { file } => {
            let input = read_input(file.as_deref())?;
            print!("{}", normalize_output(&input));
        }
        Commands::Run {
            command,
            generator,
            allow,
            max_iterations,
            test_timeout,
            task_id,
            yes,
            deny_scope,
            events,
        } => {
            let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
            if !project_path.exists() {
                eprintln!(
                    "{} Project directory does not exist: {}",
                    "Error:".red().bold(),
                    project_path.display()
                );
                std::process::exit(1);
            }

            let args = RunArgs {
                command,
                generator,
                allow,
                max_iterations,
                test_timeout: test_timeout.map(Duration::from_secs),
                task_id,
                approval_mode: if yes {
                    ApprovalMode::AutoApprove
                } else if deny_scope {
                    ApprovalMode::AutoDeny
                } else {
                    ApprovalMode::Prompt
                },
                events,
            };

            let code = match run_repair(&project_path, args).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    e.exit_code()
                }
            };
            std::process::exit(code);
        }
        Commands::Options {
            reason,
            remaining,
            files,
            json,
        } => {
            let reason = match reason.parse::<StopReason>() {
                Ok(reason) => reason,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    let valid: Vec<&str> = StopReason::all().iter().map(|r| r.as_str()).collect();
                    eprintln!("Valid reasons: {}", valid.join(", "));
                    std::process::exit(e.exit_code());
                }
            };

            let context = DecisionContext {
                repair_remaining: remaining,
                pending_scope_files: files,
                ..Default::default()
            };
            let options = generate_decision_options(reason, &context);
            if json {
                println!("{}", serde_json::to_string_pretty(&options)?);
            } else {
                println!("{} {}", "Stop reason:".bold(), reason);
                println!("  {}", reason.description());
                print_options(&options);
            }
        }
    }

    Ok(())
}

struct RunArgs {
    command: Option<String>,
    generator: Option<String>,
    allow: Vec<String>,
    max_iterations: Option<u32>,
    test_timeout: Option<Duration>,
    task_id: Option<String>,
    approval_mode: ApprovalMode,
    events: Option<PathBuf>,
}

/// Verify, then repair on failure. Returns the process exit code.
async fn run_repair(project: &Path, args: RunArgs) -> mend::Result<i32> {
    let config = MendConfig::load(project)?;

    let test_command = args
        .command
        .or(config.test_command)
        .ok_or_else(|| MendError::config("No test command: pass --command or set testCommand"))?;
    let generator_command = args.generator.or(config.generator_command).ok_or_else(|| {
        MendError::config("No generator command: pass --generator or set generatorCommand")
    })?;

    let mut policy = config.policy;
    if let Some(max) = args.max_iterations {
        policy.max_repair_iterations = max;
    }
    policy.validate()?;

    let mut allowed = config.allowed_files;
    allowed.extend(args.allow);

    let mut test_runner = CommandTestRunner::new(test_command.as_str(), project);
    if let Some(timeout) = args.test_timeout {
        test_runner = test_runner.with_timeout(timeout);
    }

    println!("{} {}", "Verifying:".bold(), test_command);
    let initial = test_runner
        .run_test()
        .await
        .map_err(|e| MendError::tool(test_command.as_str(), e.to_string()))?;
    if initial.passed() {
        println!("{} Verification passed", "✓".green().bold());
        return Ok(0);
    }
    println!(
        "{} Verification failed (exit {}), starting repair loop",
        "✗".red().bold(),
        initial.exit_code
    );

    let capabilities = RepairCapabilities::new(
        Arc::new(test_runner),
        Arc::new(CommandDiffGenerator::new(generator_command, project)),
        Arc::new(GitApplyApplicator::new(project)?),
    );

    let mut sink = FanoutEventSink::new().with_sink(Arc::new(TracingEventSink));
    if let Some(path) = args.events.or(config.events_log) {
        let path = if path.is_absolute() {
            path
        } else {
            project.join(path)
        };
        sink = sink.with_sink(Arc::new(JsonlEventSink::new(path)));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let task_id = args
        .task_id
        .unwrap_or_else(|| format!("repair-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let runner = SelfCorrectionRunner::new(task_id, policy, capabilities)
        .with_approval_manager(Arc::new(TerminalApprovalManager::new(args.approval_mode)))
        .with_event_sink(sink);

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} finishing current stage...", "Cancelling:".yellow().bold());
            token.cancel();
        }
    });

    match runner
        .start_repair_loop(initial, &allowed, &test_command)
        .await?
    {
        None => {
            println!(
                "{} Repaired after {} diff(s)",
                "✓".green().bold(),
                runner.history().len()
            );
            Ok(0)
        }
        Some(stop) => {
            print_stop(&stop);
            Ok(EXIT_STOPPED)
        }
    }
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            Ok(input)
        }
    }
}

fn print_stop(stop: &StopEvent) {
    println!(
        "\n{} {}",
        "Repair loop stopped:".yellow().bold(),
        stop.reason.description()
    );
    println!("  Reason:     {}", stop.reason);
    println!("  Diffs:      {}", stop.iteration);
    println!("  Remaining:  {}", stop.repair_remaining);
    if let Some(ref failure) = stop.last_failure {
        println!("  Failure:    {} ({})", failure.failure_type, failure.summary);
    }
    print_options(&stop.decision_options);
}

fn print_options(options: &[DecisionOption]) {
    println!("\n{}", "Next steps:".bold());
    for (i, option) in options.iter().enumerate() {
        println!("  {}. {} [{}]", i + 1, option.label.cyan(), option.id);
        println!("     {}", option.description);
    }
}
