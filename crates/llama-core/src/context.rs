//! Safe RAII wrapper around `llama_context`.

use std::sync::Arc;

use tracing::debug;

use crate::batch::LlamaBatch;
use crate::error::{LlamaError, Result};
use crate::model::LlamaModel;

/// Owns a `llama_context` pointer and keeps its model alive.
pub struct LlamaContext {
    ptr: *mut llama_sys::llama_context,
    model: Arc<LlamaModel>,
}

// Safety: every mutating call takes &mut self; callers put the context
// behind a Mutex before sharing it.
unsafe impl Send for LlamaContext {}

impl LlamaContext {
    pub fn new(model: Arc<LlamaModel>, params: &ContextParams) -> Result<Self> {
        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = params.n_ctx;
        raw.n_batch = params.n_batch;
        raw.n_ubatch = params.n_ubatch.min(params.n_batch);
        raw.n_threads = params.n_threads;
        raw.n_threads_batch = params.n_threads;
        raw.embeddings = false;

        let ctx = unsafe { llama_sys::llama_init_from_model(model.as_ptr(), raw) };
        if ctx.is_null() {
            return Err(LlamaError::ContextCreationFailed(
                "llama_init_from_model returned null".into(),
            ));
        }

        let ctx = Self { ptr: ctx, model };
        debug!(n_ctx = ctx.n_ctx(), n_batch = ctx.n_batch(), "Context created");
        Ok(ctx)
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_context {
        self.ptr
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    pub fn n_ctx(&self) -> u32 {
        unsafe { llama_sys::llama_n_ctx(self.ptr) }
    }

    pub fn n_batch(&self) -> u32 {
        unsafe { llama_sys::llama_n_batch(self.ptr) }
    }

    /// Run the decoder over `batch`.
    pub fn decode(&mut self, batch: &mut LlamaBatch) -> Result<()> {
        let rc = unsafe { llama_sys::llama_decode(self.ptr, batch.raw()) };
        if rc != 0 {
            return Err(LlamaError::DecodeFailed(rc));
        }
        Ok(())
    }

    /// Logits for the token at index `i` of the last decoded batch.
    pub fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        unsafe {
            let p = llama_sys::llama_get_logits_ith(self.ptr, i);
            if p.is_null() {
                None
            } else {
                Some(std::slice::from_raw_parts(p, self.model.n_vocab() as usize))
            }
        }
    }

    /// Forget everything decoded so far.
    pub fn kv_cache_clear(&mut self) {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if !mem.is_null() {
                llama_sys::llama_memory_clear(mem, true);
            }
        }
    }

    pub fn perf(&self) -> PerfData {
        let d = unsafe { llama_sys::llama_perf_context(self.ptr) };
        PerfData {
            t_p_eval_ms: d.t_p_eval_ms,
            t_eval_ms: d.t_eval_ms,
            n_p_eval: d.n_p_eval,
            n_eval: d.n_eval,
        }
    }

    pub fn perf_reset(&mut self) {
        unsafe { llama_sys::llama_perf_context_reset(self.ptr) }
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama context");
            unsafe { llama_sys::llama_free(self.ptr) }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context window; 0 uses the model's training size.
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: default_threads(),
        }
    }
}

/// Threads to use when the caller does not say.
pub fn default_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// Timings llama.cpp collected since the last reset.
#[derive(Debug, Clone, Default)]
pub struct PerfData {
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_p_eval: i32,
    pub n_eval: i32,
}

impl PerfData {
    /// Prompt processing speed (tokens/s).
    pub fn prompt_tokens_per_sec(&self) -> f64 {
        rate(self.n_p_eval, self.t_p_eval_ms)
    }

    /// Generation speed (tokens/s).
    pub fn generation_tokens_per_sec(&self) -> f64 {
        rate(self.n_eval, self.t_eval_ms)
    }
}

fn rate(n: i32, ms: f64) -> f64 {
    if ms > 0.0 { n as f64 / (ms / 1000.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_rates() {
        let perf = PerfData {
            t_p_eval_ms: 500.0,
            t_eval_ms: 2000.0,
            n_p_eval: 100,
            n_eval: 50,
        };
        assert_eq!(perf.prompt_tokens_per_sec(), 200.0);
        assert_eq!(perf.generation_tokens_per_sec(), 25.0);
        assert_eq!(PerfData::default().generation_tokens_per_sec(), 0.0);
    }

    #[test]
    fn default_params_use_at_least_one_thread() {
        let params = ContextParams::default();
        assert!(params.n_threads >= 1);
        assert!(params.n_ubatch <= params.n_batch);
    }
}
