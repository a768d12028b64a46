//! Process-wide llama.cpp backend setup.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Once;

use tracing::{debug, info};

static BACKEND_INIT: Once = Once::new();
static LOG_ROUTE: Once = Once::new();

/// Token proving the llama.cpp backend has been initialized.
///
/// llama.cpp keeps its backend state in globals, so the first
/// [`LlamaBackend::init`] does the work and later calls return a fresh
/// token. Nothing is torn down until process exit; a host app linking the
/// bridge may call into it again at any time.
#[derive(Debug, Clone, Copy)]
pub struct LlamaBackend {
    _private: (),
}

impl LlamaBackend {
    /// Initialize the backend (idempotent).
    pub fn init() -> Self {
        BACKEND_INIT.call_once(|| {
            unsafe {
                llama_sys::llama_backend_init();
            }
            info!("llama.cpp backend initialized");
        });
        Self { _private: () }
    }

    /// Initialize the backend and send llama.cpp's log output through
    /// `tracing` (target `llama.cpp`) instead of stderr.
    pub fn init_with_tracing() -> Self {
        let backend = Self::init();
        LOG_ROUTE.call_once(|| {
            unsafe {
                llama_sys::llama_log_set(Some(forward_log), std::ptr::null_mut());
            }
            debug!("llama.cpp log callback installed");
        });
        backend
    }

    /// Compile-time feature summary reported by llama.cpp.
    pub fn system_info(&self) -> String {
        unsafe {
            CStr::from_ptr(llama_sys::llama_print_system_info())
                .to_string_lossy()
                .into_owned()
        }
    }
}

unsafe extern "C" fn forward_log(
    level: llama_sys::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    let msg = msg.trim();
    if msg.is_empty() {
        return;
    }
    // ggml_log_level: DEBUG=1, INFO=2, WARN=3, ERROR=4, CONT=5
    match level {
        4 => tracing::error!(target: "llama.cpp", "{msg}"),
        3 => tracing::warn!(target: "llama.cpp", "{msg}"),
        2 => tracing::debug!(target: "llama.cpp", "{msg}"),
        _ => tracing::trace!(target: "llama.cpp", "{msg}"),
    }
}
