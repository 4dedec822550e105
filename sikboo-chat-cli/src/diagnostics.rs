//! Command Line and Logging
//!
//! Command-line definition for the chat client and the tracing subscriber
//! setup. Logs go to stderr so chat output on stdout stays clean.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sikboo_chat_protocol::ConversationId;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Sikboo chat command-line interface
#[derive(Parser, Debug)]
#[command(name = "sikboo-chat")]
#[command(about = "Chat client for Sikboo group purchases", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ChatCommand,
}

#[derive(Subcommand, Debug)]
pub enum ChatCommand {
    /// Print recent history, then follow the live feed and send stdin lines
    Watch {
        /// Group purchase ID
        conversation: ConversationId,

        /// History pages to load before following
        #[arg(short, long, default_value = "1")]
        pages: usize,

        /// Member ID to send as (overrides the config file)
        #[arg(short, long)]
        member: Option<i64>,
    },

    /// Print message history
    History {
        /// Group purchase ID
        conversation: ConversationId,

        /// Pages to load (0 = all)
        #[arg(short, long, default_value = "1")]
        pages: usize,

        /// Page size (overrides the config file)
        #[arg(short, long)]
        size: Option<usize>,
    },

    /// Print the total number of messages
    Count {
        /// Group purchase ID
        conversation: ConversationId,
    },

    /// Send one message
    Send {
        /// Group purchase ID
        conversation: ConversationId,

        /// Message text
        text: String,

        /// Post over HTTP instead of the live connection
        #[arg(long)]
        http: bool,

        /// Member ID to send as (overrides the config file)
        #[arg(short, long)]
        member: Option<i64>,
    },

    /// Show current configuration
    DumpConfig {
        /// Show the auth token
        #[arg(long)]
        show_sensitive: bool,
    },
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    debug!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}
