//! Configuration management for the Vapula CLI.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Command-line arguments
//! 2. Environment variables (VAPULA_*)
//! 3. Config file (~/.config/vapula/config.toml)
//! 4. Default values

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default base model to use when --base-model is not specified.
    #[serde(default)]
    pub default_base_model: Option<String>,

    /// Default output directory for checkpoints and adapters.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Default root directory for the tokenized-dataset cache.
    #[serde(default = "default_tokenized_cache_dir")]
    pub tokenized_cache_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./vapula-lora")
}

fn default_tokenized_cache_dir() -> PathBuf {
    PathBuf::from("./tokenized")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_base_model: None,
            output_dir: default_output_dir(),
            tokenized_cache_dir: default_tokenized_cache_dir(),
        }
    }
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// Reports warnings for configuration errors but falls back to defaults.
    pub fn load() -> Self {
        let config_path = Self::config_path();

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("VAPULA_"));

        match figment.extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("\x1b[33mWarning:\x1b[0m Configuration error, using defaults");
                eprintln!("  Config file: {}", config_path.display());
                eprintln!("  Error: {}", e);
                eprintln!();
                eprintln!("  To fix, edit or delete the config file:");
                eprintln!("    rm {}", config_path.display());
                eprintln!();
                Config::default()
            }
        }
    }

    /// Returns the path to the config file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vapula")
            .join("config.toml")
    }

    /// Returns the path to the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vapula")
    }

    /// Saves the current configuration to the config file.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_dir = Self::config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        std::fs::write(Self::config_path(), toml_str)?;
        Ok(())
    }

    /// Sets the default base model and saves.
    pub fn set_default_base_model(&mut self, model: &str) -> Result<(), std::io::Error> {
        self.default_base_model = Some(model.to_string());
        self.save()
    }

    /// Clears the default base model and saves.
    pub fn clear_default_base_model(&mut self) -> Result<(), std::io::Error> {
        self.default_base_model = None;
        self.save()
    }
}

/// Prints the current configuration and its sources.
pub fn show_config() {
    let config = Config::load();
    let config_path = Config::config_path();

    println!("Vapula Configuration");
    println!("====================\n");

    println!("Config file: {}", config_path.display());
    if config_path.exists() {
        println!("Status: Found\n");
    } else {
        println!("Status: Not found (using defaults)\n");
    }

    println!("Current settings:");
    println!(
        "  default_base_model: {}",
        config.default_base_model.as_deref().unwrap_or("(not set)")
    );
    println!("  output_dir: {}", config.output_dir.display());
    println!(
        "  tokenized_cache_dir: {}",
        config.tokenized_cache_dir.display()
    );

    println!("\nEnvironment variables:");
    println!("  VAPULA_DEFAULT_BASE_MODEL");
    println!("  VAPULA_OUTPUT_DIR");
    println!("  VAPULA_TOKENIZED_CACHE_DIR");
}
