//! Pure-Rust GGUF probe.
//!
//! Reads just the header and leading metadata of `.gguf` files so the
//! bridge can validate a model and describe it without going through
//! llama.cpp:
//!
//! * [`probe`]: magic, version and counts only.
//! * [`quick_scan`]: header plus well-known metadata keys.
//! * [`list_models`]: every model under a directory, split shards grouped.

pub mod reader;
pub mod types;

pub use reader::{ModelEntry, ModelSummary, list_models, probe, probe_reader, quick_scan};
pub use types::{GGUFError, GGUFHeader, GGUFMetadataKV, GGUFValue, GGUFValueType, file_type_name};
