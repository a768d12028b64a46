//! Model lifecycle and generation behind the C ABI.
//!
//! A single process-wide [`Runtime`] caches one loaded model and reloads it
//! only when the resolved model path or load settings change. All access
//! goes through [`global`], which serializes callers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Instant;

use llama_core::{LlamaBackend, LlamaContext, LlamaModel, TokenSink};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::params::{GenerationParameters, GenerationResult};
use crate::validate::ModelFile;

/// A loaded model with its own inference context.
pub struct Session {
    path: PathBuf,
    model: Arc<LlamaModel>,
    ctx: LlamaContext,
}

impl Session {
    /// Load `file` with the load settings from `cfg`.
    pub fn open(file: &ModelFile, cfg: &BridgeConfig) -> Result<Self> {
        let backend = LlamaBackend::init_with_tracing();
        info!(system = %backend.system_info(), "llama.cpp backend ready");

        let model = Arc::new(LlamaModel::load_from_file(file.path(), &cfg.model_params())?);
        let ctx = LlamaContext::new(model.clone(), &cfg.context_params())?;
        info!(
            size = %crate::storage::human_size(model.size()),
            n_ctx = ctx.n_ctx(),
            n_ctx_train = model.n_ctx_train(),
            has_template = model.chat_template().is_some(),
            "Session ready"
        );
        Ok(Self {
            path: file.path().to_path_buf(),
            model,
            ctx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// Decode `prompt` and check that real logits come back.
    pub fn smoke(&mut self, prompt: &str) -> Result<usize> {
        let tokens = llama_core::tokenize(self.model.vocab(), prompt, true, false)?;
        let n_vocab = llama_core::smoke_check(&mut self.ctx, &tokens)?;
        Ok(n_vocab)
    }

    /// Generate a reply to `prompt`, passing every piece to `sink` as it is
    /// produced. At most `params.effective_max_tokens(cap)` tokens.
    pub fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParameters,
        cap: u32,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationResult> {
        let system = params.system_prompt.as_deref();
        let text = llama_core::build_prompt(&self.model, system, prompt);
        let templated = system.is_some_and(|s| !s.trim().is_empty());
        let tokens = llama_core::tokenize(self.model.vocab(), &text, true, templated)?;

        let request = llama_core::GenerateRequest {
            tokens,
            max_tokens: params.effective_max_tokens(cap),
            stop_words: params.stop.clone(),
            sampling: params.sampling(),
        };

        self.ctx.kv_cache_clear();
        self.ctx.perf_reset();
        let started = Instant::now();

        let mut output = String::new();
        let mut collect = |piece: &str| {
            output.push_str(piece);
            sink.piece(piece)
        };
        let outcome = llama_core::generate_blocking(&mut self.ctx, &request, &mut collect)?;

        let result = GenerationResult {
            text: output,
            generation_time: started.elapsed(),
            tokens_generated: outcome.completion_tokens,
            prompt_tokens: outcome.prompt_tokens,
            finish_reason: outcome.finish_reason,
        };
        let perf = self.ctx.perf();
        info!(
            tokens = result.tokens_generated,
            prompt_tokens = result.prompt_tokens,
            finish = %result.finish_reason,
            elapsed_ms = result.generation_time.as_millis() as u64,
            gen_tps = format_args!("{:.1}", perf.generation_tokens_per_sec()),
            "Generation complete"
        );
        Ok(result)
    }
}

/// Process-wide bridge state.
pub struct Runtime {
    config: BridgeConfig,
    session: Option<Session>,
    last_output: Option<String>,
}

impl Runtime {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: None,
            last_output: None,
        }
    }

    /// Runtime configured from the settings file and environment, falling
    /// back to defaults if the file is unusable.
    pub fn from_environment() -> Self {
        let config = BridgeConfig::load_or_default().unwrap_or_else(|e| {
            warn!("Ignoring bridge config: {e}");
            let mut cfg = BridgeConfig::default();
            cfg.apply_overrides(|k| std::env::var(k).ok());
            cfg
        });
        if let Err(e) = config.storage().ensure_dirs() {
            warn!(root = %config.storage().root().display(), "Cannot create storage directories: {e}");
        }
        Self::new(config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Replace the configuration. The loaded model is dropped if the new
    /// settings would load it differently.
    pub fn set_config(&mut self, config: BridgeConfig) {
        if config.load_settings_differ(&self.config) || config.model_path != self.config.model_path
        {
            self.unload();
        }
        self.config = config;
    }

    /// Point the runtime at a specific model file. The file is validated
    /// up front; loading happens on the next request.
    pub fn set_model_path(&mut self, path: &Path) -> Result<()> {
        let file = ModelFile::validate(path, None)?;
        if self.session.as_ref().is_some_and(|s| s.path() != file.path()) {
            self.unload();
        }
        self.config.model_path = Some(file.path().to_path_buf());
        Ok(())
    }

    /// The model requests will use: the configured path, else the first
    /// GGUF model found in the storage `Models/` directory.
    pub fn resolve_model(&self) -> Result<ModelFile> {
        if let Some(path) = &self.config.model_path {
            return ModelFile::validate(path, None);
        }

        let models_dir = self.config.storage().models_dir();
        let models = gguf_parser::list_models(&models_dir).unwrap_or_else(|e| {
            warn!(dir = %models_dir.display(), "Model scan failed: {e}");
            Vec::new()
        });
        match models.into_iter().next() {
            Some(entry) => {
                let expected = (entry.shards.len() == 1).then_some(entry.file_size);
                ModelFile::validate(&entry.path, expected)
            }
            None => Err(BridgeError::NoActiveModel { models_dir }),
        }
    }

    /// The loaded session for the current model, loading it if needed.
    pub fn session(&mut self) -> Result<&mut Session> {
        let file = self.resolve_model()?;
        if self.session.as_ref().is_some_and(|s| s.path() != file.path()) {
            self.unload();
        }
        let session = match self.session.take() {
            Some(session) => session,
            None => Session::open(&file, &self.config)?,
        };
        Ok(self.session.insert(session))
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn unload(&mut self) {
        if let Some(session) = self.session.take() {
            info!(path = %session.path().display(), "Unloading model");
        }
    }

    /// Load the model, decode the smoke prompt and read back logits.
    pub fn smoke_test(&mut self) -> Result<()> {
        let prompt = self.config.smoke_prompt.clone();
        let session = self.session()?;
        let n_vocab = session.smoke(&prompt)?;
        info!(path = %session.path().display(), n_vocab, "Smoke test passed");
        Ok(())
    }

    /// One-shot generation. The text is also kept as the last output.
    pub fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult> {
        self.generate_stream(prompt, params, &mut |_: &str| true)
    }

    /// Streaming generation on the calling thread.
    pub fn generate_stream(
        &mut self,
        prompt: &str,
        params: &GenerationParameters,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationResult> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("prompt is empty".into()));
        }
        let cap = self.config.max_tokens_cap;
        let result = self.session()?.generate(prompt, params, cap, sink)?;
        self.last_output = Some(result.text.clone());
        Ok(result)
    }

    pub fn last_output(&self) -> Option<&str> {
        self.last_output.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn clear_last_output(&mut self) {
        self.last_output = None;
    }
}

static RUNTIME: LazyLock<Mutex<Runtime>> =
    LazyLock::new(|| Mutex::new(Runtime::from_environment()));

/// Lock the process-wide runtime.
///
/// A panic while the lock was held leaves the model in an unknown state;
/// the lock is recovered and the model unloaded.
pub fn global() -> MutexGuard<'static, Runtime> {
    RUNTIME.lock().unwrap_or_else(|poisoned| {
        warn!("Runtime lock poisoned; unloading model");
        let mut guard = poisoned.into_inner();
        guard.unload();
        RUNTIME.clear_poison();
        guard
    })
}
