//! Sampler chain construction.

use serde::{Deserialize, Serialize};

use crate::context::LlamaContext;

/// RAII wrapper around a `llama_sampler` chain.
pub struct SamplerChain {
    ptr: *mut llama_sys::llama_sampler,
}

unsafe impl Send for SamplerChain {}

impl SamplerChain {
    fn empty() -> Self {
        let params = llama_sys::llama_sampler_chain_params { no_perf: true };
        let ptr = unsafe { llama_sys::llama_sampler_chain_init(params) };
        Self { ptr }
    }

    fn push(&mut self, sampler: *mut llama_sys::llama_sampler) {
        unsafe { llama_sys::llama_sampler_chain_add(self.ptr, sampler) }
    }

    /// Build the chain described by `params`: penalties, truncation, then
    /// temperature + seeded draw (or greedy when temperature is 0).
    pub fn from_params(params: &SamplingParams) -> Self {
        let mut chain = Self::empty();

        if params.repeat_penalty != 1.0 {
            chain.push(unsafe {
                llama_sys::llama_sampler_init_penalties(
                    params.repeat_last_n,
                    params.repeat_penalty,
                    0.0,
                    0.0,
                )
            });
        }
        if params.top_k > 0 {
            chain.push(unsafe { llama_sys::llama_sampler_init_top_k(params.top_k) });
        }
        if params.top_p < 1.0 {
            chain.push(unsafe { llama_sys::llama_sampler_init_top_p(params.top_p, 1) });
        }
        if params.min_p > 0.0 {
            chain.push(unsafe { llama_sys::llama_sampler_init_min_p(params.min_p, 1) });
        }

        if params.temperature > 0.0 {
            let seed = params.seed.unwrap_or(llama_sys::LLAMA_DEFAULT_SEED);
            chain.push(unsafe { llama_sys::llama_sampler_init_temp(params.temperature) });
            chain.push(unsafe { llama_sys::llama_sampler_init_dist(seed) });
        } else {
            chain.push(unsafe { llama_sys::llama_sampler_init_greedy() });
        }

        chain
    }

    /// Sample the next token from the logits at batch index `idx`.
    pub fn sample(&mut self, ctx: &LlamaContext, idx: i32) -> i32 {
        unsafe { llama_sys::llama_sampler_sample(self.ptr, ctx.as_ptr(), idx) }
    }
}

impl Drop for SamplerChain {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
        }
    }
}

/// User-facing sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temp")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_temp() -> f32 {
    0.7
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_repeat_last_n() -> i32 {
    64
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temp(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            seed: None,
        }
    }
}
