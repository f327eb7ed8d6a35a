mod cmd;
mod output;
mod settings;

use clap::{Parser, Subcommand};
use cmd::run::RunExit;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kc-sequencer",
    about = "Run adversary kill chains one after another against a Caldera control plane",
    version,
    propagate_version = true
)]
struct Cli {
    /// YAML config file (lowest precedence after built-in defaults)
    #[arg(long, global = true, env = "KC_CONFIG")]
    config: Option<PathBuf>,

    /// Control plane base URL (overrides CALDERA_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Adversary list, e.g. "A,B@group2,C:group3" (overrides ADV_LIST)
    #[arg(long, global = true)]
    adversaries: Option<String>,

    /// Default agent group (overrides GROUP)
    #[arg(long, global = true)]
    group: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the adversary list and run every enabled kill chain in order
    Run {
        /// Exit after the summary instead of waiting for a termination signal
        #[arg(long)]
        no_hold: bool,
    },

    /// Show the enabled jobs without contacting the control plane
    Plan,
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = settings::Overrides {
        url: cli.url.as_deref(),
        adversaries: cli.adversaries.as_deref(),
        group: cli.group.as_deref(),
    };

    let result = settings::load(cli.config.as_deref(), &overrides).and_then(|config| {
        match cli.command.unwrap_or(Commands::Run { no_hold: false }) {
            Commands::Run { no_hold } => cmd::run::run(config, no_hold, cli.json),
            Commands::Plan => cmd::plan::run(&config, cli.json),
        }
    });

    if let Err(e) = result {
        let code = e.downcast_ref::<RunExit>().map_or(1, RunExit::exit_code);
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(code);
    }
}
