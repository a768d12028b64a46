//! Bridge configuration, persisted as JSON under `Settings/`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::storage::{StorageLayout, write_atomically};

pub const ENV_MODEL_PATH: &str = "THOTH_MODEL_PATH";
pub const ENV_STORAGE_DIR: &str = "THOTH_STORAGE_DIR";
pub const ENV_N_CTX: &str = "THOTH_N_CTX";
pub const ENV_N_GPU_LAYERS: &str = "THOTH_N_GPU_LAYERS";

const CONFIG_FILE: &str = "bridge.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Model to use; when unset the first GGUF in `Models/` is picked.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Overrides the platform storage root.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Context window (0 = model's training size).
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    /// Layers to offload to the GPU (0 = CPU only, -1 = all).
    #[serde(default)]
    pub n_gpu_layers: i32,
    #[serde(default)]
    pub n_threads: Option<i32>,
    /// Hard ceiling on tokens per request (0 = no ceiling).
    #[serde(default = "default_max_tokens_cap")]
    pub max_tokens_cap: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_smoke_prompt")]
    pub smoke_prompt: String,
}

fn default_n_ctx() -> u32 {
    2048
}
fn default_max_tokens_cap() -> u32 {
    128
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_smoke_prompt() -> String {
    "Hello".into()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            storage_dir: None,
            n_ctx: default_n_ctx(),
            n_gpu_layers: 0,
            n_threads: None,
            max_tokens_cap: default_max_tokens_cap(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            smoke_prompt: default_smoke_prompt(),
        }
    }
}

impl BridgeConfig {
    pub fn storage(&self) -> StorageLayout {
        StorageLayout::new(
            self.storage_dir
                .clone()
                .unwrap_or_else(StorageLayout::default_root),
        )
    }

    pub fn config_file(storage: &StorageLayout) -> PathBuf {
        storage.settings_dir().join(CONFIG_FILE)
    }

    /// Load from the settings directory (or defaults when there is no file),
    /// then apply environment overrides.
    pub fn load_or_default() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// [`load_or_default`](Self::load_or_default) with an injectable
    /// environment.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let storage = env(ENV_STORAGE_DIR)
            .map(StorageLayout::new)
            .unwrap_or_else(|| StorageLayout::new(StorageLayout::default_root()));
        let path = Self::config_file(&storage);

        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!(path = %path.display(), "No bridge config file, using defaults");
            Self::default()
        };
        if cfg.storage_dir.is_none() && env(ENV_STORAGE_DIR).is_some() {
            cfg.storage_dir = Some(storage.root().to_path_buf());
        }
        cfg.apply_overrides(env);
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))
    }

    /// Persist to `Settings/bridge.json` under this config's storage root.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_file(&self.storage());
        let data = serde_json::to_vec_pretty(self)?;
        write_atomically(&path, &data)?;
        Ok(path)
    }

    /// Environment values win over the file. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(path) = env(ENV_MODEL_PATH).filter(|p| !p.is_empty()) {
            self.model_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = env(ENV_STORAGE_DIR).filter(|p| !p.is_empty()) {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = env(ENV_N_CTX) {
            match v.parse() {
                Ok(n) => self.n_ctx = n,
                Err(_) => warn!(value = %v, "Ignoring invalid {ENV_N_CTX}"),
            }
        }
        if let Some(v) = env(ENV_N_GPU_LAYERS) {
            match v.parse() {
                Ok(n) => self.n_gpu_layers = n,
                Err(_) => warn!(value = %v, "Ignoring invalid {ENV_N_GPU_LAYERS}"),
            }
        }
    }

    /// Set one field from its string form (used by `thoth config set`).
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "model_path" => self.model_path = non_empty(value).map(PathBuf::from),
            "storage_dir" => self.storage_dir = non_empty(value).map(PathBuf::from),
            "n_ctx" => self.n_ctx = parse(key, value)?,
            "n_gpu_layers" => self.n_gpu_layers = parse(key, value)?,
            "n_threads" => {
                self.n_threads = non_empty(value).map(|v| parse(key, v)).transpose()?
            }
            "max_tokens_cap" => self.max_tokens_cap = parse(key, value)?,
            "temperature" => self.temperature = parse(key, value)?,
            "top_p" => self.top_p = parse(key, value)?,
            "smoke_prompt" => self.smoke_prompt = value.to_string(),
            _ => return Err(BridgeError::Config(format!("Unknown config key: {key}"))),
        }
        Ok(())
    }

    /// Settings that require reloading the model when they change.
    pub fn load_settings_differ(&self, other: &Self) -> bool {
        self.n_ctx != other.n_ctx
            || self.n_gpu_layers != other.n_gpu_layers
            || self.n_threads != other.n_threads
    }

    pub fn model_params(&self) -> llama_core::ModelParams {
        llama_core::ModelParams {
            n_gpu_layers: self.n_gpu_layers,
            ..Default::default()
        }
    }

    pub fn context_params(&self) -> llama_core::ContextParams {
        let mut params = llama_core::ContextParams {
            n_ctx: self.n_ctx,
            ..Default::default()
        };
        if let Some(threads) = self.n_threads.filter(|t| *t > 0) {
            params.n_threads = threads;
        }
        params
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::Config(format!("{key}: {e}")))
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn empty_json_gives_defaults() {
        let cfg: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, BridgeConfig::default());
        assert_eq!(cfg.max_tokens_cap, 128);
        assert_eq!(cfg.n_gpu_layers, 0);
        assert_eq!(cfg.smoke_prompt, "Hello");
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = BridgeConfig::default();
        cfg.apply_overrides(env_of(&[
            (ENV_MODEL_PATH, "/models/tiny.gguf"),
            (ENV_N_CTX, "4096"),
            (ENV_N_GPU_LAYERS, "lots"),
        ]));
        assert_eq!(cfg.model_path, Some(PathBuf::from("/models/tiny.gguf")));
        assert_eq!(cfg.n_ctx, 4096);
        assert_eq!(cfg.n_gpu_layers, 0);
    }

    #[test]
    fn save_then_load_from_storage_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();

        let mut cfg = BridgeConfig {
            storage_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        cfg.set_key("temperature", "0.2").unwrap();
        let saved = cfg.save().unwrap();
        assert!(saved.ends_with("Settings/bridge.json"));

        let loaded = BridgeConfig::load_with(env_of(&[(ENV_STORAGE_DIR, root.as_str())])).unwrap();
        assert_eq!(loaded.temperature, 0.2);
        assert_eq!(loaded.storage_dir.as_deref(), Some(tmp.path()));
    }

    #[test]
    fn missing_file_means_defaults_under_env_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let cfg = BridgeConfig::load_with(env_of(&[(ENV_STORAGE_DIR, root.as_str())])).unwrap();
        assert_eq!(cfg.storage().models_dir(), tmp.path().join("Models"));
        assert_eq!(cfg.n_ctx, 2048);
    }

    #[test]
    fn corrupt_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageLayout::new(tmp.path());
        write_atomically(&BridgeConfig::config_file(&storage), b"{ nope").unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let err = BridgeConfig::load_with(env_of(&[(ENV_STORAGE_DIR, root.as_str())])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn set_key_validates() {
        let mut cfg = BridgeConfig::default();
        cfg.set_key("n_threads", "6").unwrap();
        assert_eq!(cfg.context_params().n_threads, 6);
        cfg.set_key("model_path", "  ").unwrap();
        assert_eq!(cfg.model_path, None);
        assert!(cfg.set_key("n_ctx", "big").is_err());
        assert!(cfg.set_key("colour", "blue").is_err());
    }

    #[test]
    fn only_load_settings_force_reload() {
        let base = BridgeConfig::default();
        let hotter = BridgeConfig {
            temperature: 1.2,
            ..base.clone()
        };
        let wider = BridgeConfig {
            n_ctx: 8192,
            ..base.clone()
        };
        assert!(!base.load_settings_differ(&hotter));
        assert!(base.load_settings_differ(&wider));
    }
}
