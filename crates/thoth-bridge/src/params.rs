//! Request and result types shared by the ABI and the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;

/// Parameters for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Applied through the model's chat template when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_max_tokens() -> u32 {
    256
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            system_prompt: None,
            stop: Vec::new(),
            seed: None,
        }
    }
}

impl GenerationParameters {
    /// Defaults with the sampling settings from `cfg`.
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            ..Self::default()
        }
    }

    /// `max_tokens` limited by `cap`; a cap of 0 means no limit.
    pub fn effective_max_tokens(&self, cap: u32) -> u32 {
        if cap == 0 {
            self.max_tokens
        } else {
            self.max_tokens.min(cap)
        }
    }

    pub fn sampling(&self) -> llama_core::SamplingParams {
        llama_core::SamplingParams {
            temperature: self.temperature.max(0.0),
            top_p: self.top_p.clamp(0.0, 1.0),
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// Outcome of a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub generation_time: Duration,
    pub tokens_generated: u32,
    pub prompt_tokens: u32,
    pub finish_reason: llama_core::FinishReason,
}

impl GenerationResult {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.generation_time.as_secs_f64();
        if secs > 0.0 {
            self.tokens_generated as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_limits_budget() {
        let params = GenerationParameters::default();
        assert_eq!(params.effective_max_tokens(128), 128);
        assert_eq!(params.effective_max_tokens(0), 256);
        let short = GenerationParameters {
            max_tokens: 16,
            ..Default::default()
        };
        assert_eq!(short.effective_max_tokens(128), 16);
    }

    #[test]
    fn sampling_is_sanitised() {
        let params = GenerationParameters {
            temperature: -1.0,
            top_p: 3.0,
            seed: Some(7),
            ..Default::default()
        };
        let s = params.sampling();
        assert_eq!(s.temperature, 0.0);
        assert_eq!(s.top_p, 1.0);
        assert_eq!(s.seed, Some(7));
    }

    #[test]
    fn config_sampling_carries_over() {
        let cfg = BridgeConfig {
            temperature: 0.3,
            top_p: 0.5,
            ..Default::default()
        };
        let params = GenerationParameters::from_config(&cfg);
        assert_eq!(params.temperature, 0.3);
        assert_eq!(params.top_p, 0.5);
        assert_eq!(params.max_tokens, 256);
    }

    #[test]
    fn throughput() {
        let result = GenerationResult {
            text: "hi".into(),
            generation_time: Duration::from_millis(500),
            tokens_generated: 10,
            prompt_tokens: 3,
            finish_reason: llama_core::FinishReason::Stop,
        };
        assert_eq!(result.tokens_per_second(), 20.0);
    }
}
