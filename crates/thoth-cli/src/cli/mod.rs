pub mod config_cmd;
pub mod generate;
pub mod models;
pub mod smoke;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thoth_bridge::BridgeConfig;

#[derive(Parser)]
#[command(
    name = "thoth",
    version,
    about = "Drive the ThothAI llama.cpp bridge from the terminal"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// GGUF model to use (overrides config).
    #[arg(long, global = true, env = "THOTH_MODEL_PATH")]
    pub model: Option<PathBuf>,

    /// Storage root holding Models/ and Settings/.
    #[arg(long = "storage-dir", global = true, env = "THOTH_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the model and check that it produces logits.
    Smoke,

    /// Generate a reply to a prompt.
    Generate(GenerateArgs),

    /// Inspect models in the storage directory.
    Models(ModelsArgs),

    /// View / edit the bridge configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct GenerateArgs {
    /// Prompt text.
    pub prompt: String,

    /// Print pieces as they are generated.
    #[arg(long)]
    pub stream: bool,

    /// Token budget (still limited by `max_tokens_cap`).
    #[arg(long, default_value_t = 256)]
    pub max_tokens: u32,

    /// Temperature (default: from config).
    #[arg(long)]
    pub temp: Option<f32>,

    /// System prompt, applied through the model's chat template.
    #[arg(long)]
    pub system: Option<String>,

    /// Stop sequence (can be repeated).
    #[arg(long)]
    pub stop: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub action: ModelsAction,
}

#[derive(Debug, Subcommand)]
pub enum ModelsAction {
    /// List GGUF models.
    List {
        /// Directory to scan (default: storage Models/).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show header and metadata of a GGUF file.
    Info {
        /// Path to the GGUF file.
        path: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the effective configuration.
    Show,
    /// Set a configuration value and save it.
    Set { key: String, value: String },
}

/// Settings file plus environment, with command-line flags on top.
pub fn load_config(global: &GlobalArgs) -> anyhow::Result<BridgeConfig> {
    let mut cfg = match &global.storage_dir {
        Some(dir) => {
            let dir = dir.clone();
            BridgeConfig::load_with(move |key| match key {
                thoth_bridge::config::ENV_STORAGE_DIR => Some(dir.to_string_lossy().into_owned()),
                _ => std::env::var(key).ok(),
            })?
        }
        None => BridgeConfig::load_or_default()?,
    };
    if let Some(model) = &global.model {
        cfg.model_path = Some(model.clone());
    }
    Ok(cfg)
}
