mod scenario_common;
mod scenario_election;
mod scenario_failover;
mod scenario_merge;
mod scenario_runner;
mod scenario_split;
mod scenario_stack;

use clap::{Parser, Subcommand};
use scenario_common::SimSettings;

#[derive(Parser)]
#[command(name = "cohort-sim", about = "Run group-coordination scenarios over an in-process network")]
struct Cli {
    /// Nodes per scenario (at least 2; split and merge use at least 3).
    #[arg(short, long, default_value = "5")]
    nodes: usize,

    /// Seed for the node fitness values.
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "warn")]
    log: String,

    /// Also print JSON lines on stdout.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scenario in sequence.
    All,

    /// Run the named scenarios.
    Run {
        /// Scenario names (election, failover, split, merge, stack).
        #[arg(required = true, value_delimiter = ',')]
        scenarios: Vec<String>,
    },

    /// List the available scenarios.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = SimSettings::new(cli.nodes, cli.seed);
    let names: Vec<String> = match cli.command {
        Command::List => {
            for name in scenario_runner::ALL {
                println!("{name}");
            }
            return Ok(());
        }
        Command::All => scenario_runner::ALL.iter().map(|s| s.to_string()).collect(),
        Command::Run { scenarios } => scenarios,
    };

    if !scenario_runner::run(&names, &settings, cli.json).await? {
        std::process::exit(1);
    }
    Ok(())
}
