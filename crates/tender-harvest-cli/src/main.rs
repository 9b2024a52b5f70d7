//! tender-harvest: entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use tender_harvest::delta::VerifyMode;
use tender_harvest::reclaim::ReclaimMode;
use tender_harvest::store::RunFilter;
use tender_harvest::types::RunStatus;
use tender_harvest_cli::commands::{self, run::RunArgs};
use tender_harvest_cli::{output, Context};

#[derive(Parser)]
#[command(
    name = "tender-harvest",
    about = "Unattended, resumable extraction of tender listings from procurement portals",
    version,
    after_help = "Run 'tender-harvest <command> --help' for details on each command."
)]
struct Cli {
    /// Data directory (store, checkpoints, backups). Also reads HARVEST_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output results as JSON (machine-readable).
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one target, resuming from its checkpoint if there is one.
    Run {
        /// Target definition (JSON).
        target_file: PathBuf,

        /// Workers sharing the rendering session.
        #[arg(long, short)]
        concurrency: Option<usize>,

        /// Second pass after extraction (none, quick, full, both).
        #[arg(long, value_parser = commands::run::parse_verify)]
        verify: Option<VerifyMode>,

        /// Only run these units (repeatable).
        #[arg(long = "unit")]
        units: Vec<String>,
    },

    /// Move dead `running` runs to `timeout_auto_cleaned`.
    Reclaim {
        /// Report candidates without changing anything (default).
        #[arg(long, conflicts_with_all = ["interactive", "auto"])]
        dry_run: bool,

        /// Ask before reclaiming each run.
        #[arg(long, conflicts_with = "auto")]
        interactive: bool,

        /// Reclaim every dead run without asking.
        #[arg(long)]
        auto: bool,

        /// Age threshold in hours (minimum 12).
        #[arg(long)]
        min_age_hours: Option<i64>,
    },

    /// List persisted runs, newest first.
    Runs {
        #[command(subcommand)]
        action: Option<RunsAction>,

        /// Only runs of this target.
        #[arg(long)]
        target: Option<String>,

        /// Only runs in this status.
        #[arg(long, value_parser = commands::runs::parse_status)]
        status: Option<RunStatus>,

        /// Maximum rows.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Create this period's backups and prune expired ones.
    Backup {
        /// List existing artifacts instead.
        #[arg(long)]
        list: bool,
    },

    /// Inspect or discard saved progress.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   tender-harvest completions bash > ~/.local/share/bash-completion/completions/tender-harvest
    ///   tender-harvest completions zsh > ~/.zfunc/_tender-harvest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// Show one run.
    Show { run_id: i64 },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Show the checkpoint of a target.
    Show { target: String },
    /// Delete the checkpoint of a target.
    Clear { target: String },
    /// List every checkpoint.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json {
        std::env::set_var("HARVEST_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("HARVEST_QUIET", "1");
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::resolve(cli.data_dir.as_deref());
    tracing::debug!(data_dir = %ctx.config.data_dir.display(), "configuration resolved");

    let result = match cli.command {
        Commands::Run {
            target_file,
            concurrency,
            verify,
            units,
        } => commands::run::run(
            &ctx,
            &target_file,
            RunArgs {
                concurrency,
                verify,
                only_units: units,
            },
        )
        .await
        .map(|_| ()),

        Commands::Reclaim {
            dry_run: _,
            interactive,
            auto,
            min_age_hours,
        } => {
            let mode = if auto {
                ReclaimMode::Automatic
            } else if interactive {
                ReclaimMode::Interactive
            } else {
                ReclaimMode::DryRun
            };
            commands::reclaim::run(&ctx, mode, min_age_hours).map(|_| ())
        }

        Commands::Runs {
            action: Some(RunsAction::Show { run_id }),
            ..
        } => commands::runs::show(&ctx, run_id).map(|_| ()),
        Commands::Runs {
            action: None,
            target,
            status,
            limit,
        } => commands::runs::run(
            &ctx,
            RunFilter {
                target,
                status,
                limit: Some(limit),
            },
        )
        .map(|_| ()),

        Commands::Backup { list: true } => commands::backup::list(&ctx).map(|_| ()),
        Commands::Backup { list: false } => commands::backup::sweep(&ctx).map(|_| ()),

        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show { target } => commands::checkpoint::show(&ctx, &target),
            CheckpointAction::Clear { target } => commands::checkpoint::clear(&ctx, &target),
            CheckpointAction::List => commands::checkpoint::list(&ctx).map(|_| ()),
        },

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "tender-harvest", &mut std::io::stdout());
            Ok(())
        }
    };

    // 0 = success, 1 = error
    if let Err(e) = &result {
        if output::is_json() {
            output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        } else if !output::is_quiet() {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
