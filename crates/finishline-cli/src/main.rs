//! finishline CLI
//!
//! Command-line front-end for handing out finish tokens and recording which
//! athlete received each one, kept in sync with the other devices at the
//! event.

use std::fs::File;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use finishline_core::{Config, EntryMethod};

mod commands;
mod output;
mod session;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "finishline")]
#[command(about = "finishline - finish tokens shared across devices at timed events")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize finishline (first-time setup)
    Init,
    /// Device identity management
    Device {
        #[command(subcommand)]
        command: Option<DeviceCommands>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create, join and inspect events
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Take the next token
    Claim,
    /// Record which athlete received a token
    Assign {
        /// Token number or label (42 or P0042)
        token: String,
        /// Athlete barcode (A123456); leave empty with ""
        barcode: String,
        /// Athlete name
        #[arg(short, long)]
        name: Option<String>,
        /// How the barcode was captured (scan, manual, qr)
        #[arg(short, long)]
        method: Option<EntryMethod>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Remove a token's assignment
    Clear {
        /// Token number or label
        token: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Rename the current event
    Rename {
        /// New event name (1 to 20 characters)
        name: String,
    },
    /// Move the shared next token
    SetNext {
        /// Next token to hand out
        next: i64,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Start the token sequence over on every device
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List assignments
    #[command(alias = "ls")]
    History {
        /// Fetch everything from peers and the history store first
        #[arg(short, long)]
        pull: bool,
    },
    /// Show device, event and connection status
    Status,
    /// Stay connected and print changes as they arrive
    Watch,
}

#[derive(Subcommand, Clone)]
enum DeviceCommands {
    /// Show the device id
    Show,
    /// Set the name shown for this device
    Name {
        /// Display name
        name: String,
    },
    /// List devices seen in the current event
    List,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, relay_url, store_path, share_base_url, device_name, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum EventCommands {
    /// Start a new event and switch to it
    New {
        /// Event name
        #[arg(short, long)]
        name: Option<String>,
        /// First token to hand out
        #[arg(long)]
        next: Option<i64>,
    },
    /// Join an event by id or share link
    Join {
        /// Event id or link
        event: String,
    },
    /// Show the current event
    Show,
    /// Print the link other devices use to join
    Link,
    /// List events stored on this device
    #[command(alias = "ls")]
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work even when the config is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, &output),
        };
    }

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Init => commands::device::init(config, &output).await,
        Commands::Device { command } => match command {
            Some(DeviceCommands::Show) | None => commands::device::show(config, &output),
            Some(DeviceCommands::Name { name }) => {
                commands::device::name(config, name, &output).await
            }
            Some(DeviceCommands::List) => commands::device::list(config, &output).await,
        },
        Commands::Event { command } => handle_event_command(command, config, &output).await,
        Commands::Claim => commands::token::claim(config, &output).await,
        Commands::Assign {
            token,
            barcode,
            name,
            method,
            yes,
        } => {
            let request = commands::token::AssignRequest {
                token,
                barcode,
                name,
                method,
                yes,
            };
            commands::token::assign(config, request, &output).await
        }
        Commands::Clear { token, yes } => commands::token::clear(config, token, yes, &output).await,
        Commands::Rename { name } => commands::event::rename(config, name, &output).await,
        Commands::SetNext { next, yes } => {
            commands::event::set_next(config, next, yes, &output).await
        }
        Commands::Reset { yes } => commands::event::reset(config, yes, &output).await,
        Commands::History { pull } => commands::history::list(config, pull, &output).await,
        Commands::Status => commands::status::show(config, &output).await,
        Commands::Watch => commands::watch::run(config, &output).await,
    }
}

async fn handle_event_command(command: EventCommands, config: Config, output: &Output) -> Result<()> {
    match command {
        EventCommands::New { name, next } => commands::event::new(config, name, next, output).await,
        EventCommands::Join { event } => commands::event::join(config, event, output).await,
        EventCommands::Show => commands::event::show(config, output).await,
        EventCommands::Link => commands::event::link(config, output).await,
        EventCommands::List => commands::event::list(config, output),
    }
}

/// Initialize logging
///
/// Only initializes if FINISHLINE_LOG environment variable is set.
/// Logs to file (config.log_file or default {data_dir}/debug.log).
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("FINISHLINE_LOG") else {
        return;
    };

    let log_path = config
        .log_file
        .clone()
        .unwrap_or_else(|| config.data_dir.join("debug.log"));

    let log_file = match File::options().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    let env_filter = EnvFilter::new(format!(
        "finishline_core={},finishline_cli={}",
        log_level, log_level
    ));

    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}
