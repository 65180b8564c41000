mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "projsync",
    about = "Reconcile a GitHub project board against declarative rules",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest .projsync.yaml above the current directory)
    #[arg(long, global = true, env = "PROJSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the live board (needs GITHUB_TOKEN)
    Run {
        /// Decide everything, write nothing
        #[arg(long)]
        dry_run: bool,

        /// Reconcile the single item in this event payload instead of a snapshot
        #[arg(long, value_name = "PATH")]
        event: Option<PathBuf>,
    },

    /// Reconcile an offline fixture board and show what would change
    Plan {
        /// YAML fixture describing the board
        #[arg(long, value_name = "PATH")]
        fixture: PathBuf,

        /// Apply the changes to the in-memory board and print the result
        #[arg(long)]
        apply: bool,
    },

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Check a column move against the configured transitions
    Transition {
        /// Current column (omit for an item with no column)
        #[arg(long)]
        from: Option<String>,

        /// Target column
        #[arg(long)]
        to: String,
    },

    /// Show the sprint decision for an item in a column
    Sprint {
        #[arg(long)]
        column: Option<String>,

        /// Iteration id currently assigned
        #[arg(long)]
        current: Option<String>,

        /// Merge/close time (RFC 3339)
        #[arg(long)]
        completed_at: Option<String>,

        /// Evaluate as of this time (RFC 3339, default: now)
        #[arg(long)]
        now: Option<String>,

        /// Read iterations from a fixture instead of the live board
        #[arg(long, value_name = "PATH")]
        fixture: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run { dry_run, event } => cmd::run::run(config, dry_run, event.as_deref(), cli.json),
        Commands::Plan { fixture, apply } => cmd::plan::run(config, &fixture, apply, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
        Commands::Transition { from, to } => {
            cmd::transition::run(config, from.as_deref(), &to, cli.json)
        }
        Commands::Sprint {
            column,
            current,
            completed_at,
            now,
            fixture,
        } => cmd::sprint::run(
            config,
            cmd::sprint::SprintArgs {
                column,
                current,
                completed_at,
                now,
                fixture,
            },
            cli.json,
        ),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
