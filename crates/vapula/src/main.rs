//! # Vapula CLI
//!
//! *"The Duke teaches the handicraft of all professions, philosophy and
//! the sciences"*
//!
//! The command-line launcher for parameter-efficient fine-tuning runs.

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "vapula")]
#[command(author = "Daemoniorum Engineering")]
#[command(version)]
#[command(about = "Parameter-efficient fine-tuning launcher", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a fine-tuning run
    Train(Box<commands::TrainArgs>),

    /// Display version and build info
    Version,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show config file path
    Path,

    /// Set the default base model
    SetBaseModel {
        /// Model repo id or local path
        model: String,
    },

    /// Clear the default base model
    ClearBaseModel,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Initialize logging
    let telemetry_config = phenex::TelemetryConfig::new("vapula")
        .with_log_level(&cli.log_level);

    let telemetry_config = if cli.json_logs {
        telemetry_config.with_json_logs()
    } else {
        telemetry_config
    };

    phenex::init_logging(&telemetry_config);

    // Load configuration for default values
    let cfg = config::Config::load();

    match cli.command {
        Commands::Train(args) => {
            commands::train(*args, &cfg)?;
        }

        Commands::Version => {
            commands::version();
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                config::show_config();
            }
            ConfigAction::Path => {
                println!("{}", config::Config::config_path().display());
            }
            ConfigAction::SetBaseModel { model } => {
                let mut cfg = cfg;
                cfg.set_default_base_model(&model)?;
                println!("Default base model set to: {model}");
            }
            ConfigAction::ClearBaseModel => {
                let mut cfg = cfg;
                cfg.clear_default_base_model()?;
                println!("Default base model cleared");
            }
        },
    }

    Ok(())
}
