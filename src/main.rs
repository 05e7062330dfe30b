//! StepRunner CLI Entry Point
//!
//! Runs the steps of a study locally and reports their status.
//!
//! # Usage
//!
//! ```bash
//! # Run every step of a study
//! steprunner run study.yaml
//!
//! # Set up workspaces and scripts without running anything
//! steprunner run study.yaml --dry-run
//!
//! # Limit concurrent instances
//! steprunner run study.yaml --parallel 8
//!
//! # Show the status of every instance under a workspace
//! steprunner status ./studies/demo
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};

use steprunner::execution::{ExecutionBridge, LocalAdapter, StepRunner};
use steprunner::workflow::status::{collect_statuses, StatusRecord, StepState};
use steprunner::workflow::load_study;
use steprunner::{APP_NAME, VERSION};

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Run(PathBuf),
    Status(PathBuf),
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    dry_run: bool,
    max_parallel: Option<usize>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Step Lifecycle Manager");
    println!();
}

fn print_usage() {
    println!("Usage: steprunner <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run <STUDY_FILE>    Expand and run every step of a study");
    println!("  status <WORKSPACE>  Show the status of every instance");
    println!();
    println!("Options:");
    println!("  --dry-run           Create workspaces and scripts only");
    println!("  --parallel N        Maximum concurrent instances (default: CPU count)");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  steprunner run study.yaml --parallel 8");
    println!("  steprunner status ./studies/demo");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut positional: Vec<&str> = Vec::new();
    let mut dry_run = false;
    let mut max_parallel = None;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => dry_run = true,
            "--verbose" | "-v" => verbose = true,
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                let n: usize = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", args[i]))?;
                if n == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                max_parallel = Some(n);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        ["run", path] => Command::Run(PathBuf::from(path)),
        ["status", path] => Command::Status(PathBuf::from(path)),
        ["run"] | ["status"] => return Err(format!("'{}' requires a path argument", positional[0])),
        [] => return Err("No command given".to_string()),
        [other, ..] if *other != "run" && *other != "status" => {
            return Err(format!("Unknown command: {}", other))
        }
        [_, _, extra, ..] => return Err(format!("Unexpected argument: {}", extra)),
        _ => return Err("Invalid arguments".to_string()),
    };

    Ok(Config {
        command,
        dry_run,
        max_parallel,
        verbose,
    })
}

fn run_study(config: &Config, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut study = load_study(path).map_err(|e| {
        error!("Failed to load study: {}", e);
        format!("Could not load study from '{}': {}", path.display(), e)
    })?;

    if config.dry_run {
        study.adapter.dry_run = true;
    }
    if study.adapter.dry_run {
        info!("Mode: DRY RUN (scripts are written, nothing executes)");
    }

    let root = study.workspace_root();
    info!("Workspace: {}", root.display());

    let bridge = ExecutionBridge::new(study.adapter.clone(), LocalAdapter::new());
    let mut runner = StepRunner::new(bridge, study.queue_resolver(), &root);
    if let Some(n) = config.max_parallel {
        runner.set_max_parallel(n);
    }
    info!("Running up to {} instance(s) at once", runner.max_parallel());

    let summary = runner.run_all(&study.steps, &study.parameters)?;

    let failed: Vec<_> = summary.failed().collect();
    info!(
        "Study '{}' done: {} instance(s), {} succeeded, {} failed",
        study.name,
        summary.len(),
        summary.succeeded().count(),
        failed.len()
    );

    if failed.is_empty() {
        return Ok(());
    }
    for report in &failed {
        warn!("  {} -> {}", report.name, report.status.result);
    }
    Err(format!("{} instance(s) did not succeed", failed.len()).into())
}

fn colored_state(state: StepState) -> String {
    let text = format!("{:<11}", state.as_str());
    match state {
        StepState::Finished => text.green().to_string(),
        StepState::Failed => text.red().bold().to_string(),
        StepState::Running => text.yellow().to_string(),
        StepState::DryRun => text.cyan().to_string(),
        StepState::Cancelled => text.magenta().to_string(),
        StepState::Initialized | StepState::Unknown => text,
    }
}

fn print_status_table(records: &[StatusRecord]) {
    let width = records
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<width$}  {:<11}  {:<30}  {:>15}  {:>15}  {:>8}",
        "NAME",
        "STATE",
        "RESULT",
        "ELAPSED",
        "RUN TIME",
        "RESTARTS",
        width = width
    );
    for r in records {
        println!(
            "{:<width$}  {}  {:<30}  {:>15}  {:>15}  {:>8}",
            r.name,
            colored_state(r.state),
            r.result,
            r.elapsed_time,
            r.run_time,
            r.restarts,
            width = width
        );
    }
}

fn show_status(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("Workspace does not exist: {}", path.display()).into());
    }

    let records = collect_statuses(path)?;
    if records.is_empty() {
        warn!("No status files found under {}", path.display());
        return Ok(());
    }
    print_status_table(&records);
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    match &config.command {
        Command::Run(path) => {
            print_banner();
            run_study(&config, path)
        }
        Command::Status(path) => show_status(path),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
