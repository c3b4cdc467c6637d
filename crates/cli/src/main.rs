mod backend;
mod config;
mod presenter;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use events::EventBus;
use genbatch_core::Catalog;
use orchestrator::{
    CompletionPolicy, InProcessLauncher, Monitor, Orchestrator, ReportLog, RunOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::Backend;
use crate::config::{BackendKind, GenbatchConfig, CONFIG_FILE, GENBATCH_DIR};

#[derive(Parser)]
#[command(name = "genbatch")]
#[command(about = "Resumable batch generation over a subject/variant catalog")]
#[command(version)]
struct Cli {
    /// Project directory containing `.genbatch/`
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Owner scope, overriding `[scope] owner`
    #[arg(long, global = true)]
    owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize genbatch in the project directory
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Load subjects and variants from a JSON catalog (sqlite backend)
    Import {
        /// Catalog file: {"subjects": [...], "variants": [...]}
        catalog: PathBuf,
    },

    /// Run the batch until nothing eligible remains
    Run(RunArgs),

    /// Watch progress and relaunch runs until the scope is done
    Monitor(MonitorArgs),

    /// Show task counts for the scope
    Stats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Tasks processed at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Tasks claimed per round
    #[arg(long)]
    batch_size: Option<usize>,

    /// Target languages, comma separated
    #[arg(long, value_delimiter = ',')]
    languages: Option<Vec<String>>,

    /// Reset completed tasks and generate them again
    #[arg(long)]
    regenerate: bool,

    /// Pick up tasks that failed in earlier runs
    #[arg(long)]
    resume: bool,

    /// Pause between rounds, in seconds
    #[arg(long)]
    cooldown: Option<u64>,

    /// Per-task timeout, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop after this many rounds
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Stop after this many tasks
    #[arg(long)]
    max_items: Option<usize>,

    /// Include subjects without a category
    #[arg(long)]
    allow_uncategorized: bool,

    /// Append the run summary to this JSON report
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print the result as JSON and suppress progress output
    #[arg(long)]
    json: bool,

    /// Also show claims and round totals
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn apply(&self, mut options: RunOptions) -> RunOptions {
        if let Some(n) = self.max_concurrent {
            options.max_concurrent = n;
        }
        if let Some(n) = self.batch_size {
            options.batch_size = n;
        }
        if let Some(languages) = &self.languages {
            options.languages = languages.clone();
        }
        if self.regenerate {
            options.skip_completed = false;
        }
        if self.resume {
            options.resume_from_failure = true;
        }
        if let Some(secs) = self.cooldown {
            options.cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout {
            options.step_timeout = Duration::from_secs(secs);
        }
        if self.allow_uncategorized {
            options = options.with_require_category(false);
        }
        options.max_rounds = self.max_rounds.or(options.max_rounds);
        options.max_items = self.max_items.or(options.max_items);
        options
    }
}

#[derive(Args)]
struct MonitorArgs {
    /// Seconds between stats polls
    #[arg(long)]
    poll: Option<u64>,

    /// Seconds between progress reports
    #[arg(long)]
    report_every: Option<u64>,

    /// Completed tasks that count as done
    #[arg(long)]
    target: Option<u64>,

    /// Count skipped tasks toward the target
    #[arg(long)]
    count_skipped: bool,

    /// Release in-progress claims older than this many seconds
    #[arg(long)]
    stale_after: Option<u64>,

    /// Give up after launching this many runs
    #[arg(long)]
    max_launches: Option<u32>,

    /// Also show polls, claims and round totals
    #[arg(short, long)]
    verbose: bool,
}

struct Workspace {
    dir: PathBuf,
    config: GenbatchConfig,
}

impl Workspace {
    fn load(cli: &Cli) -> Result<Self> {
        let dir = cli.project.join(GENBATCH_DIR);
        let mut config = GenbatchConfig::load(&dir)?;
        if let Some(owner) = &cli.owner {
            config.scope.owner = owner.clone();
        }
        Ok(Self { dir, config })
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "genbatch=info,orchestrator=info,db=info,remote=info".into()
        }))
        .init();
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "Interrupt received, stopping after the current round...".yellow()
            );
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let workspace = Workspace::load(&cli)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&workspace, force).await,
        Commands::Import { ref catalog } => cmd_import(&workspace, catalog).await,
        Commands::Run(ref args) => cmd_run(&workspace, args).await,
        Commands::Monitor(ref args) => cmd_monitor(&workspace, args).await,
        Commands::Stats { json } => cmd_stats(&workspace, json).await,
    }
}

async fn cmd_init(workspace: &Workspace, force: bool) -> Result<()> {
    let dir = &workspace.dir;
    let config_path = dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        println!("Already initialized at {}", dir.display());
        println!("Use --force to overwrite the config.");
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    workspace.config.save(dir)?;
    println!("{} {}", "Created".green(), config_path.display());

    if workspace.config.store.backend == BackendKind::Sqlite {
        Backend::open(&workspace.config, dir).await?;
        println!(
            "{} {}",
            "Created".green(),
            dir.join(&workspace.config.store.database).display()
        );
    }

    println!();
    println!("Next steps:");
    println!("  1. Edit {} (owner, generator url)", config_path.display());
    println!("  2. genbatch import catalog.json");
    println!("  3. genbatch run");
    Ok(())
}

async fn cmd_import(workspace: &Workspace, path: &PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let catalog: Catalog = serde_json::from_str(&content)
        .with_context(|| format!("Invalid catalog in {}", path.display()))?;

    let backend = Backend::open(&workspace.config, &workspace.dir).await?;
    let Some(store) = backend.sqlite() else {
        bail!("Import writes to the local database; the rest backend reads its catalog remotely");
    };

    let owner = &workspace.config.scope.owner;
    let (subjects, variants) = store.catalog().import(owner, &catalog).await?;
    println!(
        "Imported {} subjects and {} variants for {}",
        subjects,
        variants,
        owner.bold()
    );
    Ok(())
}

async fn cmd_run(workspace: &Workspace, args: &RunArgs) -> Result<()> {
    let options = args.apply(workspace.config.run.to_options());
    options.validate()?;
    let scope = workspace.config.scope();

    let backend = Backend::open(&workspace.config, &workspace.dir).await?;
    let step = Arc::new(backend::generator(&workspace.config.generator));

    let bus = EventBus::new();
    let progress = (!args.json).then(|| presenter::spawn(&bus, args.verbose));
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let orchestrator = Orchestrator::new(backend.source, backend.store, step)
        .with_event_bus(bus.clone())
        .with_cancellation(cancel);
    let result = orchestrator.run(&scope, &options).await?;

    // Closing the bus lets the presenter drain and exit.
    drop(orchestrator);
    drop(bus);
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    if let Some(path) = &args.report {
        let runs = ReportLog::append(path, &result).await?;
        tracing::info!(path = %path.display(), runs, "Report updated");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        presenter::print_run_result(&result);
    }

    if let Some(reason) = &result.aborted {
        bail!("Run aborted: {}", reason);
    }
    Ok(())
}

async fn cmd_monitor(workspace: &Workspace, args: &MonitorArgs) -> Result<()> {
    let mut config = workspace
        .config
        .monitor
        .to_config(workspace.config.scope(), &workspace.config.run);
    if let Some(secs) = args.poll {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.report_every {
        config.report_interval = Duration::from_secs(secs);
    }
    if let Some(target) = args.target {
        config.target_total = Some(target);
    }
    if args.count_skipped {
        config.completion_policy = CompletionPolicy::CompletedOrSkipped;
    }
    if let Some(secs) = args.stale_after {
        config.stale_after = Some(Duration::from_secs(secs));
    }
    if let Some(max) = args.max_launches {
        config.max_launches = Some(max);
    }

    let backend = Backend::open(&workspace.config, &workspace.dir).await?;
    let step = Arc::new(backend::generator(&workspace.config.generator));

    let bus = EventBus::new();
    let progress = presenter::spawn(&bus, args.verbose);
    // The run gets its own token: stopping the monitor lets it finish.
    let cancel = CancellationToken::new();
    let cancel_run = CancellationToken::new();
    tokio::spawn({
        let (cancel, cancel_run) = (cancel.clone(), cancel_run.clone());
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("{}", "Interrupt received, stopping the monitor...".yellow());
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{}",
                    "Second interrupt, stopping the run after the current round...".yellow()
                );
                cancel_run.cancel();
            }
        }
    });

    let orchestrator = Orchestrator::new(backend.source, backend.store.clone(), step)
        .with_event_bus(bus.clone())
        .with_cancellation(cancel_run);
    let launcher = Arc::new(InProcessLauncher::new(orchestrator));
    let monitor = Monitor::new(backend.store, launcher, config)?.with_event_bus(bus);

    let summary = monitor.run_and_drain(cancel).await;
    progress.abort();

    presenter::print_monitor_summary(&summary);
    if !summary.reached_target && !summary.cancelled {
        bail!("Monitor stopped before the target was reached");
    }
    Ok(())
}

async fn cmd_stats(workspace: &Workspace, json: bool) -> Result<()> {
    let backend = Backend::open(&workspace.config, &workspace.dir).await?;
    let scope = workspace.config.scope();
    let stats = backend
        .store
        .get_stats(&scope)
        .await
        .context("Failed to load stats")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        presenter::print_stats(&scope.owner_id, &stats);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::parse_from([
            "genbatch",
            "run",
            "--languages",
            "en,de",
            "--regenerate",
            "--resume",
            "--cooldown",
            "0",
            "--max-items",
            "10",
            "--allow-uncategorized",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let options = args.apply(RunOptions::default());
        assert_eq!(options.languages, vec!["en", "de"]);
        assert!(!options.skip_completed);
        assert!(options.resume_from_failure);
        assert!(options.cooldown.is_zero());
        assert_eq!(options.max_items, Some(10));
        assert!(!options.require_category);
        assert_eq!(options.max_concurrent, RunOptions::default().max_concurrent);
    }

    #[test]
    fn test_owner_flag_is_global() {
        let cli = Cli::parse_from(["genbatch", "stats", "--owner", "user-7", "--json"]);
        assert_eq!(cli.owner.as_deref(), Some("user-7"));
        assert!(matches!(cli.command, Commands::Stats { json: true }));
    }
}
