//! Batchflow CLI Entry Point
//!
//! Submits and resumes checkpointed jobs from inside a batch allocation.
//!
//! # Usage
//!
//! ```bash
//! # Run the demo job in the current directory
//! batchflow
//!
//! # Run with a job configuration
//! batchflow --config job.yaml
//!
//! # Resume under requeue semantics (typically from the submission script)
//! batchflow --config job.yaml -r
//!
//! # Create the next free numbered run directory and run there
//! batchflow --new-dir
//!
//! # Override configuration entries
//! batchflow job.nnodes=8 walltime.forward=15
//! ```

use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;

use log::{error, info, warn};

use batchflow::config::JobConfig;
use batchflow::error::GraphError;
use batchflow::execution::{run_remote, Engine, JobContext, MpiWork, Outcome, TaskRegistry};
use batchflow::scheduler;
use batchflow::workflow::{restore, Directory, Node, NodeRef, Workspace, WorkspaceExt};
use batchflow::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Cli {
    remote: Option<String>,
    config_path: Option<String>,
    requeue: bool,
    new_dir: bool,
    verbose: bool,
    overrides: Vec<String>,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: batchflow [OPTIONS] [SECTION.KEY=VALUE]...");
    println!();
    println!("Options:");
    println!("  --config FILE       Job configuration (YAML)");
    println!("  -r, --requeue       Resume under requeue semantics");
    println!("  --new-dir           Create the next free job.NNNN run directory");
    println!("  --remote DIR:FID    Run a registered task entry (internal)");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  batchflow --config job.yaml -r");
    println!("  batchflow --new-dir job.nnodes=8 workspace.tag=smooth");
}

/// Parses command-line arguments into a Cli struct.
fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();
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
            "--remote" => {
                i += 1;
                if i >= args.len() {
                    return Err("--remote requires a dir:fid argument".to_string());
                }
                cli.remote = Some(args[i].clone());
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a file argument".to_string());
                }
                cli.config_path = Some(args[i].clone());
            }
            "--requeue" | "-r" => {
                cli.requeue = true;
            }
            "--new-dir" => {
                cli.new_dir = true;
            }
            "--verbose" | "-v" => {
                cli.verbose = true;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg if arg.contains('=') => {
                cli.overrides.push(arg.to_string());
            }
            arg => {
                return Err(format!("Unexpected argument: {}", arg));
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Creates the next free numbered run directory (`job.0001`, `job.0002`, ...).
fn next_run_directory(name: &str) -> io::Result<Directory> {
    for i in 1..10_000 {
        let dir = format!("{}.{:04}", name, i);
        if !Path::new(&dir).exists() {
            std::fs::create_dir_all(&dir)?;
            return Ok(Directory::new(dir));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free run directory for '{}'", name),
    ))
}

/// Entry points runnable through `--remote`.
fn task_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_fn("hello", || {
        println!("hello from a remote rank");
        Ok(())
    });
    registry
}

/// A small shell-task job exercising the engine end to end: a serial
/// prepare step, a concurrent event group launched through the dispatcher,
/// and a summary step.
fn build_demo_job(ctx: &Rc<JobContext>) -> Result<NodeRef, GraphError> {
    let root = Workspace::new_root(ctx.config.name.clone());

    {
        let base = ctx.basedir.clone();
        root.add_fn("prepare", move || {
            base.mkdir("events")?;
            Ok(())
        })?;
    }

    let events = root.add(Node::Workspace(Workspace::concurrent("events")))?;
    for i in 1..=2 {
        let name = format!("ev{:02}", i);
        let dir = ctx.basedir.subdir(format!("events/{}", name));
        let ctx = ctx.clone();
        events.add_async(&name, move || {
            let ctx = ctx.clone();
            let dir = dir.clone();
            Box::pin(async move {
                ctx.mpiexec(
                    &dir,
                    MpiWork::Command(format!("echo event {:02} processed", i)),
                    1,
                    1,
                    0,
                    None,
                    true,
                )
                .await
            })
        })?;
    }

    {
        let base = ctx.basedir.clone();
        root.add_fn("summarize", move || {
            base.write("summary.txt", "all events processed\n")?;
            Ok(())
        })?;
    }

    Ok(root)
}

/// Main application entry point.
async fn run() -> Result<Outcome, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);

    // A remote invocation runs one registered entry and nothing else.
    if let Some(spec) = &cli.remote {
        run_remote(&task_registry(), spec).await?;
        return Ok(Outcome::Done);
    }

    print_banner();

    let mut config = match &cli.config_path {
        Some(path) => {
            info!("Loading configuration: {}", path);
            JobConfig::from_yaml(path).map_err(|e| {
                error!("Failed to load configuration: {}", e);
                format!("Could not load configuration from '{}': {}", path, e)
            })?
        }
        None => JobConfig::default(),
    };
    for spec in &cli.overrides {
        config.apply_override(spec)?;
    }

    let basedir = if cli.new_dir {
        let dir = next_run_directory(&config.name)?;
        info!("Run directory: {}", dir.path().display());
        dir
    } else {
        Directory::new(".")
    };

    let scheduler = scheduler::from_config(&config);
    let ctx = Rc::new(JobContext::new(config, scheduler, basedir, cli.requeue));

    let root = build_demo_job(&ctx)?;
    if ctx.checkpoint.exists() {
        match ctx.checkpoint.load() {
            Ok(snap) => {
                info!("Resuming from checkpoint");
                restore(&root, &snap);
                root.borrow_mut().clear_unfinished();
            }
            Err(e) => warn!("could not read checkpoint: {}", e),
        }
    }

    Ok(Engine::new(ctx).run(root).await?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(Outcome::Done) | Ok(Outcome::Requeue) => ExitCode::SUCCESS,
        Ok(Outcome::Failed(n)) => {
            eprintln!();
            eprintln!("Error: job stopped with {} unresolved condition(s)", n);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
