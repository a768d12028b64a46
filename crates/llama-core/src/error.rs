use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Decode failed with code {0}")]
    DecodeFailed(i32),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Prompt of {prompt} tokens does not fit in a context of {n_ctx}")]
    ContextOverflow { prompt: usize, n_ctx: u32 },

    #[error("Batch capacity ({0}) exceeded")]
    BatchFull(i32),

    #[error("No logits available for batch index {0}")]
    MissingLogits(i32),

    #[error("Logits contain non-finite values")]
    NonFiniteLogits,
}

pub type Result<T> = std::result::Result<T, LlamaError>;
