//! C ABI exported to the host app. Declared in `include/llama_bridge.h`.
//!
//! Every export validates its pointers, runs under `catch_unwind` and
//! reports failures through its return value plus [`thoth_get_error`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::logging;
use crate::params::GenerationParameters;
use crate::runtime::{self, Session};
use crate::validate::ModelFile;

/// Receives one piece of generated text. The pointer is only valid for the
/// duration of the call.
pub type TokenCallback = Option<unsafe extern "C" fn(piece: *const c_char)>;

/// Like [`TokenCallback`] with caller state; returning `false` stops
/// generation.
pub type TokenCallbackCtx =
    Option<unsafe extern "C" fn(piece: *const c_char, user_data: *mut c_void) -> bool>;

/// Opaque handle returned by [`thoth_load_model`].
pub struct ThothModel {
    session: Mutex<Session>,
    config: BridgeConfig,
}

static VERSION: &CStr = match CStr::from_bytes_with_nul(
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes(),
) {
    Ok(v) => v,
    Err(_) => c"unknown",
};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    /// Set while a host stream callback runs on this thread. The runtime
    /// lock is held then, so re-entering the bridge would deadlock.
    static IN_STREAM: Cell<bool> = const { Cell::new(false) };
}

// ── Helpers ───────────────────────────────────────────────────────────

fn record_error(op: &str, e: &BridgeError) {
    error!(op, "{e}");
    let msg = to_cstring(&e.to_string());
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Run `f` with logging set up and panics caught. Errors are recorded for
/// [`thoth_get_error`] before being returned.
fn run<T>(op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    logging::init();
    let outcome = if IN_STREAM.get() {
        Err(BridgeError::InvalidArgument(
            "bridge called from inside a stream callback".into(),
        ))
    } else {
        panic::catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|payload| Err(BridgeError::Panic(panic_message(payload.as_ref()))))
    };
    if let Err(e) = &outcome {
        record_error(op, e);
    }
    outcome
}

/// Borrow a C string argument as UTF-8.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(format!("{name} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| BridgeError::InvalidArgument(format!("{name} is not valid UTF-8")))
}

/// Interior NULs are dropped; C readers would stop at them.
fn to_cstring(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|&b| b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

fn into_raw_string(s: &str) -> *mut c_char {
    to_cstring(s).into_raw()
}

/// Marks this thread as inside a host callback until dropped.
struct StreamScope {
    outer: bool,
}

impl StreamScope {
    fn enter() -> Self {
        Self {
            outer: IN_STREAM.replace(true),
        }
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        IN_STREAM.set(self.outer);
    }
}

fn stream_sink(callback: unsafe extern "C" fn(*const c_char)) -> impl FnMut(&str) -> bool {
    move |piece: &str| {
        let piece = to_cstring(piece);
        let _scope = StreamScope::enter();
        unsafe { callback(piece.as_ptr()) };
        true
    }
}

fn stream_sink_ctx(
    callback: unsafe extern "C" fn(*const c_char, *mut c_void) -> bool,
    user_data: *mut c_void,
) -> impl FnMut(&str) -> bool {
    move |piece: &str| {
        let piece = to_cstring(piece);
        let _scope = StreamScope::enter();
        unsafe { callback(piece.as_ptr(), user_data) }
    }
}

fn default_params() -> GenerationParameters {
    GenerationParameters::from_config(runtime::global().config())
}

// ── Header functions ──────────────────────────────────────────────────

/// Load the configured model, decode a short prompt and read back logits.
#[unsafe(no_mangle)]
pub extern "C" fn llama_smoke_test() -> bool {
    run("llama_smoke_test", || runtime::global().smoke_test()).is_ok()
}

/// One-shot generation. The caller frees the result with
/// [`thoth_free_string`]; failures come back as `"Error: <message>"`.
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thothai_generate_test(prompt: *const c_char) -> *mut c_char {
    let outcome = run("thothai_generate_test", || {
        let prompt = unsafe { str_arg(prompt, "prompt") }?;
        let params = default_params();
        runtime::global().generate(prompt, &params)
    });
    match outcome {
        Ok(result) => into_raw_string(&result.text),
        Err(e) => into_raw_string(&format!("Error: {e}")),
    }
}

/// One-shot generation; the text is logged and kept for
/// [`thoth_last_output`].
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_generate_from_prompt(prompt: *const c_char) -> bool {
    run("llama_generate_from_prompt", || {
        let prompt = unsafe { str_arg(prompt, "prompt") }?;
        let params = default_params();
        let result = runtime::global().generate(prompt, &params)?;
        info!(
            tokens = result.tokens_generated,
            tps = format_args!("{:.1}", result.tokens_per_second()),
            output = %result.text,
            "Generated"
        );
        Ok(())
    })
    .is_ok()
}

/// Stream generated pieces to `callback` on the calling thread. Returns
/// once generation has finished.
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string. `callback` must
/// be safe to call from this thread. Bridge calls made from inside
/// `callback` fail, apart from [`thoth_get_error`] and [`thoth_free_string`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_generate_stream(
    prompt: *const c_char,
    callback: TokenCallback,
) -> bool {
    run("llama_generate_stream", || {
        let prompt = unsafe { str_arg(prompt, "prompt") }?;
        let callback =
            callback.ok_or_else(|| BridgeError::InvalidArgument("callback is null".into()))?;
        let params = default_params();
        let mut sink = stream_sink(callback);
        runtime::global().generate_stream(prompt, &params, &mut sink)?;
        Ok(())
    })
    .is_ok()
}

// ── Extended API ──────────────────────────────────────────────────────

/// Streaming with caller state; the callback can stop generation early by
/// returning `false`.
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string. `user_data` is
/// passed through untouched. `callback` must not call back into the bridge,
/// as with [`llama_generate_stream`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_generate_stream_ctx(
    prompt: *const c_char,
    callback: TokenCallbackCtx,
    user_data: *mut c_void,
) -> bool {
    run("thoth_generate_stream_ctx", || {
        let prompt = unsafe { str_arg(prompt, "prompt") }?;
        let callback =
            callback.ok_or_else(|| BridgeError::InvalidArgument("callback is null".into()))?;
        let params = default_params();
        let mut sink = stream_sink_ctx(callback, user_data);
        let result = runtime::global().generate_stream(prompt, &params, &mut sink)?;
        debug!(finish = %result.finish_reason, "Stream finished");
        Ok(())
    })
    .is_ok()
}

/// Text of the last successful generation through the global runtime, or
/// NULL. The caller frees it with [`thoth_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn thoth_last_output() -> *mut c_char {
    run("thoth_last_output", || {
        Ok(runtime::global().last_output().map(into_raw_string))
    })
    .ok()
    .flatten()
    .unwrap_or(ptr::null_mut())
}

/// Load a model into a standalone handle. NULL on failure.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_load_model(path: *const c_char) -> *mut ThothModel {
    run("thoth_load_model", || {
        let path = unsafe { str_arg(path, "path") }?;
        let file = ModelFile::validate(Path::new(path), None)?;
        let config = runtime::global().config().clone();
        let session = Session::open(&file, &config)?;
        info!(path = %file.path().display(), "Model handle created");
        Ok(Box::into_raw(Box::new(ThothModel {
            session: Mutex::new(session),
            config,
        })))
    })
    .unwrap_or(ptr::null_mut())
}

/// Release a handle from [`thoth_load_model`]. NULL is a no-op.
///
/// # Safety
/// `model` must be null or a handle not yet freed, and not in use on
/// another thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_free_model(model: *mut ThothModel) {
    if model.is_null() {
        return;
    }
    let _ = run("thoth_free_model", || {
        drop(unsafe { Box::from_raw(model) });
        Ok(())
    });
}

/// Generate with a model handle. `max_tokens <= 0` and a negative or
/// non-finite `temperature` fall back to defaults. NULL on failure; the
/// caller frees the result with [`thoth_free_string`].
///
/// # Safety
/// `model` must be a live handle from [`thoth_load_model`]; `prompt` must
/// be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_generate(
    model: *const ThothModel,
    prompt: *const c_char,
    max_tokens: i32,
    temperature: f32,
) -> *mut c_char {
    run("thoth_generate", || {
        let model = unsafe { model.as_ref() }
            .ok_or_else(|| BridgeError::InvalidArgument("model is null".into()))?;
        let prompt = unsafe { str_arg(prompt, "prompt") }?;
        if prompt.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("prompt is empty".into()));
        }

        let mut params = GenerationParameters::from_config(&model.config);
        if max_tokens > 0 {
            params.max_tokens = max_tokens as u32;
        }
        if temperature.is_finite() && temperature >= 0.0 {
            params.temperature = temperature;
        }

        let mut session = model.session.lock().unwrap_or_else(|poisoned| {
            warn!("Model handle lock poisoned; continuing with fresh KV cache");
            poisoned.into_inner()
        });
        let result = session.generate(prompt, &params, 0, &mut |_: &str| true)?;
        Ok(into_raw_string(&result.text))
    })
    .unwrap_or(ptr::null_mut())
}

/// Drop the globally cached model, if any.
#[unsafe(no_mangle)]
pub extern "C" fn thoth_unload_model() {
    let _ = run("thoth_unload_model", || {
        runtime::global().unload();
        Ok(())
    });
}

/// Use the model at `path` for the header functions. The file is checked
/// now and loaded on the next request.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_set_model_path(path: *const c_char) -> bool {
    run("thoth_set_model_path", || {
        let path = unsafe { str_arg(path, "path") }?;
        runtime::global().set_model_path(Path::new(path))
    })
    .is_ok()
}

/// Merge a JSON object of config fields into the runtime configuration.
/// Unknown fields are rejected. Changes are not persisted.
///
/// # Safety
/// `json` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_configure_json(json: *const c_char) -> bool {
    run("thoth_configure_json", || {
        let json = unsafe { str_arg(json, "json") }?;
        let patch: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;

        let mut rt = runtime::global();
        let serde_json::Value::Object(mut merged) = serde_json::to_value(rt.config())? else {
            return Err(BridgeError::Config("config is not a JSON object".into()));
        };
        for (key, value) in patch {
            if !merged.contains_key(&key) {
                return Err(BridgeError::Config(format!("Unknown config key: {key}")));
            }
            merged.insert(key, value);
        }
        let config: BridgeConfig = serde_json::from_value(serde_json::Value::Object(merged))?;
        rt.set_config(config);
        Ok(())
    })
    .is_ok()
}

/// Message of the last failure on this thread, or NULL. Owned by the
/// bridge and valid until the next failure on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn thoth_get_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

/// Free a string returned by the bridge. NULL is a no-op.
///
/// # Safety
/// `s` must be null or a string from this library not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thoth_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Crate version. Static; do not free.
#[unsafe(no_mangle)]
pub extern "C" fn thoth_version() -> *const c_char {
    VERSION.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn last_error() -> String {
        let ptr = thoth_get_error();
        assert!(!ptr.is_null());
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { thoth_free_string(ptr) };
        s
    }

    /// Point the global runtime at an empty storage root with no model or
    /// earlier output.
    fn isolate(root: &Path) {
        let json = serde_json::json!({
            "storage_dir": root,
            "model_path": null,
        })
        .to_string();
        let json = CString::new(json).unwrap();
        assert!(unsafe { thoth_configure_json(json.as_ptr()) });
        runtime::global().clear_last_output();
    }

    unsafe extern "C" fn ignore_piece(_: *const c_char) {}

    static REENTRY_REJECTED: AtomicBool = AtomicBool::new(false);

    unsafe extern "C" fn reenter_last_output(_: *const c_char) {
        let out = thoth_last_output();
        let rejected = out.is_null() && last_error().contains("inside a stream callback");
        REENTRY_REJECTED.store(rejected, Ordering::SeqCst);
    }

    unsafe extern "C" fn reenter_configure(_: *const c_char, user_data: *mut c_void) -> bool {
        let ok = unsafe { thoth_configure_json(c"{}".as_ptr()) };
        unsafe { *(user_data as *mut bool) = ok };
        true
    }

    #[test]
    #[serial]
    fn callbacks_cannot_reenter_the_runtime() {
        REENTRY_REJECTED.store(false, Ordering::SeqCst);
        {
            // Generation holds this guard while the host callback runs.
            let _rt = runtime::global();
            let mut sink = stream_sink(reenter_last_output);
            assert!(sink("piece"));

            let mut reentered = true;
            let mut sink_ctx =
                stream_sink_ctx(reenter_configure, &mut reentered as *mut bool as *mut c_void);
            assert!(sink_ctx("piece"));
            assert!(!reentered);
        }
        assert!(REENTRY_REJECTED.load(Ordering::SeqCst));

        // The flag is cleared once the callback returns.
        assert!(!IN_STREAM.get());
        unsafe { assert!(thoth_configure_json(c"{}".as_ptr())) };
    }

    #[test]
    fn stream_scope_restores_outer_state() {
        {
            let _outer = StreamScope::enter();
            {
                let _inner = StreamScope::enter();
            }
            assert!(IN_STREAM.get());
        }
        assert!(!IN_STREAM.get());
    }

    #[test]
    fn free_null_is_noop() {
        unsafe {
            thoth_free_string(ptr::null_mut());
            thoth_free_model(ptr::null_mut());
        }
    }

    #[test]
    fn version_matches_crate() {
        let v = unsafe { CStr::from_ptr(thoth_version()) };
        assert_eq!(v.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn cstring_drops_interior_nul() {
        assert_eq!(to_cstring("a\0b").as_bytes(), b"ab");
        assert_eq!(to_cstring("plain").as_bytes(), b"plain");
    }

    #[test]
    #[serial]
    fn null_arguments_fail_cleanly() {
        unsafe {
            assert!(!llama_generate_from_prompt(ptr::null()));
            assert_eq!(last_error(), "Invalid argument: prompt is null");

            assert!(!llama_generate_stream(ptr::null(), Some(ignore_piece)));
            assert!(!thoth_set_model_path(ptr::null()));
            assert!(!thoth_configure_json(ptr::null()));
            assert!(thoth_load_model(ptr::null()).is_null());
            assert!(thoth_generate(ptr::null(), c"hi".as_ptr(), 8, 0.5).is_null());
            assert_eq!(last_error(), "Invalid argument: model is null");
        }
    }

    #[test]
    #[serial]
    fn null_callback_is_rejected() {
        let prompt = c"hello";
        unsafe {
            assert!(!llama_generate_stream(prompt.as_ptr(), None));
            assert_eq!(last_error(), "Invalid argument: callback is null");
            assert!(!thoth_generate_stream_ctx(prompt.as_ptr(), None, ptr::null_mut()));
        }
    }

    #[test]
    #[serial]
    fn invalid_utf8_is_rejected() {
        let bad = [0xffu8, 0xfe, 0x00];
        let ptr = bad.as_ptr() as *const c_char;
        unsafe {
            assert!(!llama_generate_from_prompt(ptr));
        }
        assert_eq!(last_error(), "Invalid argument: prompt is not valid UTF-8");
    }

    #[test]
    #[serial]
    fn generate_test_reports_errors_as_text() {
        let reply = take_string(unsafe { thothai_generate_test(ptr::null()) });
        assert_eq!(reply, "Error: Invalid argument: prompt is null");
    }

    #[test]
    #[serial]
    fn smoke_test_without_model_fails() {
        let tmp = tempfile::tempdir().unwrap();
        isolate(tmp.path());
        assert!(!llama_smoke_test());
        assert!(last_error().starts_with("No active model selected"));

        let reply = take_string(unsafe { thothai_generate_test(c"Hello".as_ptr()) });
        assert!(reply.starts_with("Error: No active model selected"));
    }

    #[test]
    #[serial]
    fn non_gguf_model_path_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        isolate(tmp.path());
        let path = tmp.path().join("notes.bin");
        std::fs::write(&path, b"definitely not a model").unwrap();
        let c_path = CString::new(path.to_str().unwrap()).unwrap();

        assert!(!unsafe { thoth_set_model_path(c_path.as_ptr()) });
        assert!(last_error().contains("Only GGUF models are supported"));
        assert!(unsafe { thoth_load_model(c_path.as_ptr()) }.is_null());
    }

    #[test]
    #[serial]
    fn missing_model_handle_is_null() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gone.gguf");
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        assert!(unsafe { thoth_load_model(c_path.as_ptr()) }.is_null());
        assert!(last_error().starts_with("Model file missing"));
    }

    #[test]
    #[serial]
    fn configure_json_validates_input() {
        let tmp = tempfile::tempdir().unwrap();
        isolate(tmp.path());
        unsafe {
            assert!(!thoth_configure_json(c"{ not json".as_ptr()));
            assert!(last_error().starts_with("Configuration error"));

            assert!(!thoth_configure_json(c"{\"colour\": \"blue\"}".as_ptr()));
            assert_eq!(last_error(), "Configuration error: Unknown config key: colour");

            assert!(thoth_configure_json(c"{\"max_tokens_cap\": 32}".as_ptr()));
        }
        assert_eq!(runtime::global().config().max_tokens_cap, 32);
        assert_eq!(runtime::global().config().storage_dir.as_deref(), Some(tmp.path()));
    }

    #[test]
    #[serial]
    fn last_output_is_null_before_any_generation() {
        let tmp = tempfile::tempdir().unwrap();
        isolate(tmp.path());
        thoth_unload_model();
        assert!(thoth_last_output().is_null());

        // A failed generation leaves it untouched.
        assert!(!unsafe { llama_generate_from_prompt(c"hello".as_ptr()) });
        assert!(thoth_last_output().is_null());
    }
}
