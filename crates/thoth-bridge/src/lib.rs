//! On-device inference bridge for the ThothAI app.
//!
//! Exposes llama.cpp to a non-Rust host through a small C ABI (see
//! `include/llama_bridge.h` and [`ffi`]). Behind it sit:
//!
//! * [`runtime`]: the process-wide model cache and generation entry points.
//! * [`config`] and [`storage`]: settings file, env overrides, app folders.
//! * [`validate`]: model file checks before llama.cpp ever sees a path.
//!
//! The same types are used directly by the `thoth` CLI.

pub mod config;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod params;
pub mod runtime;
pub mod storage;
pub mod validate;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use params::{GenerationParameters, GenerationResult};
pub use runtime::{Runtime, Session};
pub use storage::{StorageLayout, human_size};
pub use validate::ModelFile;
