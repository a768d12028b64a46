//! Safe Rust wrapper around the llama.cpp C API.
//!
//! RAII types for the backend, models, contexts, batches and sampler
//! chains, plus a synchronous generation loop that streams text to a
//! [`TokenSink`].

pub mod backend;
pub mod batch;
pub mod chat;
pub mod context;
pub mod error;
pub mod generate;
pub mod model;
pub mod sampler;
pub mod stream;
pub mod token;

pub use backend::LlamaBackend;
pub use batch::LlamaBatch;
pub use chat::{ChatMessage, apply_template, build_prompt};
pub use context::{ContextParams, LlamaContext, PerfData, default_threads};
pub use error::{LlamaError, Result};
pub use generate::{
    FinishReason, GenerateEvent, GenerateOutcome, GenerateRequest, TokenSink, generate_blocking,
    smoke_check,
};
pub use model::{LlamaModel, ModelParams};
pub use sampler::{SamplerChain, SamplingParams};
pub use stream::{StopMatcher, Utf8Assembler};
pub use token::{detokenize, token_to_bytes, token_to_piece, tokenize};
