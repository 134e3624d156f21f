//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use harvester_core::source::SourceSpec;

/// Harvest media from content listings and relay it to a channel.
///
/// `acquire` downloads media referenced by new items in the given sources.
/// `relay` sends downloaded files to a chat, skipping content already sent.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/harvester/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enumerate sources and download new media
    Acquire(AcquireArgs),
    /// Send downloaded files to the channel
    Relay(RelayArgs),
}

/// Options shared by both subcommands. Unset values fall back to the config
/// file, then to built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Directory holding acquired files
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Ledger database file
    #[arg(long = "db", value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Retries after the first attempt for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,
}

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Source to enumerate, as `tag=path[:limit]` or `name[:limit]` (repeatable).
    /// A bare name means `r/name`; a leading `/` is verbatim (`front=/best:100`)
    #[arg(short = 's', long = "source", value_name = "SPEC", required = true)]
    pub sources: Vec<SourceSpec>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Listing API root
    #[arg(long, value_name = "URL")]
    pub listing_base_url: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Concurrent senders per bot (1-10)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub concurrency: Option<u8>,

    /// Destination chat id (channel ids are negative, e.g. -100123)
    #[arg(long, value_name = "ID", allow_hyphen_values = true)]
    pub chat_id: Option<String>,

    /// Bot token (repeatable; every bot sends in parallel under one flood gate)
    #[arg(
        long = "bot-token",
        value_name = "TOKEN",
        env = "HARVESTER_BOT_TOKEN",
        value_delimiter = ',',
        required = true,
        hide_env_values = true
    )]
    pub bot_tokens: Vec<String>,

    /// Bot API root
    #[arg(long, value_name = "URL", hide = true)]
    pub api_url: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}
