use crate::config::Config;
use crate::fs::RealFileSystem;
use crate::progress::DumbConsoleProgress;
use crate::{clean, load, signal, work};
use anyhow::{anyhow, bail};
use argh::FromArgs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `KILN_LOG=debug`.
const LOG_ENV: &str = "KILN_LOG";

/// kiln, an incremental task runner.
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<PathBuf>,

    /// task file [default=kiln.json]
    #[argh(option, short = 'f')]
    file: Option<PathBuf>,

    /// parallelism [default from system, or $KILN_NUM_PROCESS]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// print actions as they run
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Build(BuildArgs),
    Clean(CleanArgs),
    List(ListArgs),
}

/// Build tasks (the default).
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct BuildArgs {
    /// tasks to build [default from the task file]
    #[argh(positional)]
    names: Vec<String>,
}

/// Remove task targets and their recorded state.
#[derive(FromArgs)]
#[argh(subcommand, name = "clean")]
struct CleanArgs {
    /// tasks to clean [default all]
    #[argh(positional)]
    names: Vec<String>,
}

/// List tasks.
#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
struct ListArgs {}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build(config: &Config, names: Vec<String>) -> anyhow::Result<i32> {
    let state = load::read(config)?;
    let names = if !names.is_empty() {
        names
    } else if !state.default.is_empty() {
        state.default.clone()
    } else if state.registry.get("build").is_some() {
        vec!["build".to_string()]
    } else {
        bail!("no task specified and no default");
    };

    let fs = RealFileSystem::new();
    let mut progress = DumbConsoleProgress::new(config.verbose);
    let mut work = work::Work::new(&state.graph, &state.db, &fs, &mut progress, config);
    work.set_cancel(signal::interrupted());
    for name in &names {
        work.want(name)?;
    }
    let report = work.run()?;

    if report.interrupted {
        println!("kiln: interrupted");
        return Ok(1);
    }
    if !report.success() {
        println!("kiln: {} tasks failed", report.failures.len());
        return Ok(1);
    }
    match report.ran.len() {
        0 => println!("kiln: no work to do"),
        n => println!("kiln: ran {} tasks, now up to date", n),
    }
    Ok(0)
}

fn list(config: &Config) -> anyhow::Result<i32> {
    let state = load::read(config)?;
    let width = state
        .registry
        .tasks()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0);
    for task in state.registry.tasks() {
        match &task.doc {
            Some(doc) => println!("{:width$}  {}", task.name, doc, width = width),
            None => println!("{}", task.name),
        }
    }
    Ok(0)
}

fn clean_tasks(config: &Config, names: &[String]) -> anyhow::Result<i32> {
    let state = load::read(config)?;
    let removed = clean::clean(&state.graph, &state.db, names)?;
    if config.verbose {
        for path in &removed {
            println!("removed {}", path);
        }
    }
    println!("kiln: cleaned {} files", removed.len());
    Ok(0)
}

/// Entry point of the binary; returns the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    init_logging();

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let mut config = Config::from_env()?;
    if let Some(file) = args.file {
        config.task_file = file;
    }
    if let Some(jobs) = args.jobs {
        config = config.with_parallelism(jobs)?;
    }
    config.verbose = args.verbose;
    tracing::debug!("config: {:?}", config);

    signal::register_sigint();

    match args.command {
        None => build(&config, Vec::new()),
        Some(Command::Build(cmd)) => build(&config, cmd.names),
        Some(Command::Clean(cmd)) => clean_tasks(&config, &cmd.names),
        Some(Command::List(_)) => list(&config),
    }
}
