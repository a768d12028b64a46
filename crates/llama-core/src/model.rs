//! Safe RAII wrapper around `llama_model`.

use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::ptr;

use tracing::{debug, info};

use crate::error::{LlamaError, Result};

/// Owns a `llama_model` pointer and frees it on drop.
pub struct LlamaModel {
    ptr: *mut llama_sys::llama_model,
}

// Safety: llama_model is read-only after loading.
unsafe impl Send for LlamaModel {}
unsafe impl Sync for LlamaModel {}

impl LlamaModel {
    /// Load a GGUF model from `path`.
    pub fn load_from_file(path: &Path, params: &ModelParams) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| LlamaError::ModelLoadFailed {
            path: path.display().to_string(),
            reason: "Invalid UTF-8 in path".into(),
        })?;
        let c_path = CString::new(path_str).map_err(|_| LlamaError::ModelLoadFailed {
            path: path_str.into(),
            reason: "Path contains null byte".into(),
        })?;

        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = params.n_gpu_layers;
        raw.use_mmap = params.use_mmap;
        raw.use_mlock = params.use_mlock;

        info!(path = %path.display(), n_gpu_layers = params.n_gpu_layers, "Loading model");
        let model = unsafe { llama_sys::llama_model_load_from_file(c_path.as_ptr(), raw) };

        if model.is_null() {
            return Err(LlamaError::ModelLoadFailed {
                path: path_str.into(),
                reason: "llama_model_load_from_file returned null".into(),
            });
        }

        let loaded = Self { ptr: model };
        info!(desc = %loaded.desc(), params = loaded.n_params(), "Model loaded");
        Ok(loaded)
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_model {
        self.ptr
    }

    /// Vocabulary handle, valid for the lifetime of the model.
    pub fn vocab(&self) -> *const llama_sys::llama_vocab {
        unsafe { llama_sys::llama_model_get_vocab(self.ptr) }
    }

    pub fn n_params(&self) -> u64 {
        unsafe { llama_sys::llama_model_n_params(self.ptr) }
    }

    /// Size of all tensors in bytes.
    pub fn size(&self) -> u64 {
        unsafe { llama_sys::llama_model_size(self.ptr) }
    }

    /// Short description, e.g. `llama 1B Q4_K - Medium`.
    pub fn desc(&self) -> String {
        let mut buf = vec![0u8; 256];
        let len = unsafe {
            llama_sys::llama_model_desc(self.ptr, buf.as_mut_ptr() as *mut c_char, buf.len())
        };
        if len > 0 {
            buf.truncate((len as usize).min(buf.len()));
            String::from_utf8_lossy(&buf).into_owned()
        } else {
            String::new()
        }
    }

    pub fn n_ctx_train(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(self.ptr) }
    }

    /// Built-in chat template, if the GGUF carries one.
    pub fn chat_template(&self) -> Option<String> {
        unsafe {
            let p = llama_sys::llama_model_chat_template(self.ptr, ptr::null());
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    pub fn n_vocab(&self) -> i32 {
        unsafe { llama_sys::llama_vocab_n_tokens(self.vocab()) }
    }

    /// Whether a token ends generation (EOS, EOT and friends).
    pub fn is_end_of_generation(&self, token: i32) -> bool {
        unsafe { llama_sys::llama_vocab_is_eog(self.vocab(), token) }
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama model");
            unsafe { llama_sys::llama_model_free(self.ptr) }
        }
    }
}

/// Parameters for [`LlamaModel::load_from_file`].
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Layers to offload to the GPU. 0 = CPU only, -1 = all.
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}
