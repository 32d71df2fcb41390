// Chorus CLI — run the aggregator and inspect what it stored.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// ── CLI definition ─────────────────────────────────────────────────────────

/// Chorus — live chat from Twitch, Kick and YouTube in one moderated feed.
#[derive(Parser)]
#[command(name = "chorus", version, about)]
struct Cli {
    /// Config file (TOML). Falls back to CHORUS_CONFIG, then the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C.
    Run {
        /// Channel to join, as platform:channel (repeatable).
        #[arg(long = "connect", value_name = "PLATFORM:CHANNEL")]
        connect: Vec<String>,
        /// Print accepted messages as they arrive.
        #[arg(long)]
        print: bool,
    },
    /// Print the effective configuration.
    Config,
    /// Recent stored messages of a stream, newest first.
    History {
        /// Stream id, e.g. twitch-somechannel.
        stream: String,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Stored questions of a stream, newest first.
    Questions {
        stream: String,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Connection checkpoints that would be resumed on the next start.
    Checkpoints,
    /// Stored message counts per stream.
    Streams,
}

/// Shared options threaded into command handlers.
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub json: bool,
}

// ── Main ───────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let opts = GlobalOpts { config: cli.config, json: cli.json };

    if let Err(e) = dispatch(&opts, cli.command).await {
        output::print_error(&e, opts.json);
        std::process::exit(1);
    }
}

async fn dispatch(opts: &GlobalOpts, cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Run { connect, print } => commands::run(opts, &connect, print).await,
        Commands::Config => commands::show_config(opts),
        Commands::History { stream, limit } => commands::history(opts, &stream, limit, false).await,
        Commands::Questions { stream, limit } => commands::history(opts, &stream, limit, true).await,
        Commands::Checkpoints => commands::checkpoints(opts).await,
        Commands::Streams => commands::streams(opts).await,
    }
}
