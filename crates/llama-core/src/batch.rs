//! Safe wrapper around `llama_batch`.

use crate::error::{LlamaError, Result};

/// Owned single-sequence token batch.
pub struct LlamaBatch {
    inner: llama_sys::llama_batch,
    capacity: i32,
}

impl LlamaBatch {
    /// Allocate room for `capacity` tokens on sequence 0.
    pub fn new(capacity: i32) -> Self {
        let capacity = capacity.max(1);
        let inner = unsafe { llama_sys::llama_batch_init(capacity, 0, 1) };
        Self { inner, capacity }
    }

    /// The raw struct, passed by value to `llama_decode`.
    pub fn raw(&self) -> llama_sys::llama_batch {
        self.inner
    }

    pub fn n_tokens(&self) -> i32 {
        self.inner.n_tokens
    }

    pub fn clear(&mut self) {
        self.inner.n_tokens = 0;
    }

    /// Append `token` at absolute position `pos`; `logits` requests output
    /// for this position.
    pub fn push(&mut self, token: i32, pos: i32, logits: bool) -> Result<()> {
        let i = self.inner.n_tokens;
        if i >= self.capacity {
            return Err(LlamaError::BatchFull(self.capacity));
        }
        let i = i as usize;
        unsafe {
            *self.inner.token.add(i) = token;
            *self.inner.pos.add(i) = pos;
            *self.inner.n_seq_id.add(i) = 1;
            *(*self.inner.seq_id.add(i)) = 0;
            *self.inner.logits.add(i) = i8::from(logits);
        }
        self.inner.n_tokens += 1;
        Ok(())
    }
}

impl Drop for LlamaBatch {
    fn drop(&mut self) {
        unsafe { llama_sys::llama_batch_free(self.inner) }
    }
}
