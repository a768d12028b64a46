//! Tokenization helpers.

use std::ffi::{CString, c_char};

use crate::error::{LlamaError, Result};

/// Tokenize `text` with the model's vocabulary.
///
/// `add_special` prepends BOS (when the vocab wants it); `parse_special`
/// turns textual control tokens such as `<|im_start|>` into their ids.
pub fn tokenize(
    vocab: *const llama_sys::llama_vocab,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> Result<Vec<i32>> {
    let c_text = CString::new(text)
        .map_err(|_| LlamaError::TokenizationFailed("text contains null byte".into()))?;
    let text_len = i32::try_from(text.len())
        .map_err(|_| LlamaError::TokenizationFailed("text too long".into()))?;

    // Upper bound: one token per byte plus BOS/EOS.
    let mut tokens = vec![0i32; text.len() + 2];
    let mut n = unsafe {
        llama_sys::llama_tokenize(
            vocab,
            c_text.as_ptr(),
            text_len,
            tokens.as_mut_ptr(),
            tokens.len() as i32,
            add_special,
            parse_special,
        )
    };

    if n < 0 {
        // Negative result is the required size.
        tokens.resize((-n) as usize, 0);
        n = unsafe {
            llama_sys::llama_tokenize(
                vocab,
                c_text.as_ptr(),
                text_len,
                tokens.as_mut_ptr(),
                tokens.len() as i32,
                add_special,
                parse_special,
            )
        };
    }

    if n < 0 {
        return Err(LlamaError::TokenizationFailed(format!(
            "llama_tokenize returned {n}"
        )));
    }

    tokens.truncate(n as usize);
    Ok(tokens)
}

/// Raw bytes of one token. May be a fragment of a multi-byte character.
pub fn token_to_bytes(vocab: *const llama_sys::llama_vocab, token: i32) -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    let mut len = piece_into(vocab, token, &mut buf);
    if len < 0 {
        buf.resize((-len) as usize, 0);
        len = piece_into(vocab, token, &mut buf);
    }
    if len <= 0 {
        return Vec::new();
    }
    buf.truncate(len as usize);
    buf
}

/// Text of one token, lossily decoded. Prefer [`crate::Utf8Assembler`]
/// over this when concatenating a stream of tokens.
pub fn token_to_piece(vocab: *const llama_sys::llama_vocab, token: i32) -> String {
    String::from_utf8_lossy(&token_to_bytes(vocab, token)).into_owned()
}

/// Inverse of [`tokenize`] for a whole sequence. Special tokens are kept
/// as text.
pub fn detokenize(vocab: *const llama_sys::llama_vocab, tokens: &[i32]) -> Result<String> {
    if tokens.is_empty() {
        return Ok(String::new());
    }
    let n_tokens = i32::try_from(tokens.len())
        .map_err(|_| LlamaError::TokenizationFailed("too many tokens".into()))?;

    let mut buf = vec![0u8; tokens.len() * 8 + 16];
    let mut len = detokenize_into(vocab, tokens, n_tokens, &mut buf);
    if len < 0 {
        buf.resize((-len) as usize, 0);
        len = detokenize_into(vocab, tokens, n_tokens, &mut buf);
    }
    if len < 0 {
        return Err(LlamaError::TokenizationFailed(format!(
            "llama_detokenize returned {len}"
        )));
    }
    buf.truncate(len as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn detokenize_into(
    vocab: *const llama_sys::llama_vocab,
    tokens: &[i32],
    n_tokens: i32,
    buf: &mut [u8],
) -> i32 {
    unsafe {
        llama_sys::llama_detokenize(
            vocab,
            tokens.as_ptr(),
            n_tokens,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
            false, // remove_special
            true,  // unparse_special
        )
    }
}

fn piece_into(vocab: *const llama_sys::llama_vocab, token: i32, buf: &mut [u8]) -> i32 {
    unsafe {
        llama_sys::llama_token_to_piece(
            vocab,
            token,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
            0,     // lstrip
            false, // render special tokens
        )
    }
}
