use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No active model selected. Set a model path or place a .gguf file in {models_dir}")]
    NoActiveModel { models_dir: PathBuf },

    #[error("{0}")]
    UnsupportedFormat(String),

    #[error("Model file missing: {0}. The file may have been moved or deleted.")]
    ModelFileMissing(String),

    #[error("Model file unreadable: {0}. Please check file permissions.")]
    ModelFileUnreadable(String),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Internal panic: {0}")]
    Panic(String),
}

impl From<llama_core::LlamaError> for BridgeError {
    fn from(e: llama_core::LlamaError) -> Self {
        use llama_core::LlamaError as L;
        match e {
            L::ModelLoadFailed { .. } | L::ContextCreationFailed(_) => {
                Self::ModelLoadFailed(e.to_string())
            }
            other => Self::GenerationFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_errors_split_into_load_and_generation() {
        let load: BridgeError = llama_core::LlamaError::ContextCreationFailed("oom".into()).into();
        assert!(matches!(load, BridgeError::ModelLoadFailed(ref m) if m.contains("oom")));

        let decode: BridgeError = llama_core::LlamaError::DecodeFailed(1).into();
        assert_eq!(
            decode.to_string(),
            "Generation failed: Decode failed with code 1"
        );
    }

    #[test]
    fn messages_match_host_wording() {
        let e = BridgeError::ModelFileMissing("/m/x.gguf".into());
        assert_eq!(
            e.to_string(),
            "Model file missing: /m/x.gguf. The file may have been moved or deleted."
        );
    }
}
