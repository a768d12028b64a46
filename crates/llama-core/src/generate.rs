//! Synchronous token generation with streamed output.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::batch::LlamaBatch;
use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::sampler::{SamplerChain, SamplingParams};
use crate::stream::{StopMatcher, Utf8Assembler};
use crate::token::token_to_bytes;

/// Receives generated text as it is produced.
pub trait TokenSink {
    /// Called with each complete piece of text. Return `false` to stop.
    fn piece(&mut self, text: &str) -> bool;
}

impl<F> TokenSink for F
where
    F: FnMut(&str) -> bool,
{
    fn piece(&mut self, text: &str) -> bool {
        self(text)
    }
}

/// Parameters for a generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Tokenized prompt.
    pub tokens: Vec<i32>,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    pub stop_words: Vec<String>,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token.
    Stop,
    /// Reached `max_tokens`.
    Length,
    /// Ran out of context window.
    ContextFull,
    /// Matched a stop word.
    StopWord(String),
    /// The sink asked to stop.
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ContextFull => write!(f, "context_full"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a finished generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOutcome {
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Run one generation to completion on the calling thread.
///
/// The KV cache is expected to be empty (see
/// [`LlamaContext::kv_cache_clear`]). Pieces go to `sink` in order; a
/// piece is never a partial UTF-8 character nor part of a stop word.
pub fn generate_blocking<S>(
    ctx: &mut LlamaContext,
    request: &GenerateRequest,
    sink: &mut S,
) -> Result<GenerateOutcome>
where
    S: TokenSink + ?Sized,
{
    let n_ctx = ctx.n_ctx();
    let logits_idx = decode_prompt(ctx, &request.tokens)?;
    let prompt_tokens = request.tokens.len() as u32;

    let vocab = ctx.model().vocab();
    let mut source = LlamaSource {
        vocab,
        sampler: SamplerChain::from_params(&request.sampling),
        step: LlamaBatch::new(1),
        logits_idx,
        n_cur: request.tokens.len() as i32,
        last: 0,
        ctx,
    };
    let (finish_reason, completion_tokens) = drive(
        &mut source,
        request.max_tokens,
        n_ctx.saturating_sub(prompt_tokens),
        &request.stop_words,
        sink,
    )?;

    debug!(%finish_reason, prompt_tokens, completion_tokens, "Generation finished");
    Ok(GenerateOutcome {
        finish_reason,
        prompt_tokens,
        completion_tokens,
    })
}

/// Where generated tokens come from.
trait TokenSource {
    /// Sample the next token. `None` means end of generation.
    fn next_token(&mut self) -> Result<Option<Vec<u8>>>;
    /// Decode the last sampled token so the next one can be sampled.
    fn advance(&mut self) -> Result<()>;
}

struct LlamaSource<'a> {
    ctx: &'a mut LlamaContext,
    vocab: *const llama_sys::llama_vocab,
    sampler: SamplerChain,
    step: LlamaBatch,
    logits_idx: i32,
    n_cur: i32,
    last: i32,
}

impl TokenSource for LlamaSource<'_> {
    fn next_token(&mut self) -> Result<Option<Vec<u8>>> {
        let token = self.sampler.sample(&*self.ctx, self.logits_idx);
        if self.ctx.model().is_end_of_generation(token) {
            return Ok(None);
        }
        self.last = token;
        Ok(Some(token_to_bytes(self.vocab, token)))
    }

    fn advance(&mut self) -> Result<()> {
        self.step.clear();
        self.step.push(self.last, self.n_cur, true)?;
        self.n_cur += 1;
        self.ctx.decode(&mut self.step)?;
        self.logits_idx = 0;
        Ok(())
    }
}

/// The generation loop proper: token budget, end of generation, stop
/// words, sink cancellation and context room. `room` is how many tokens
/// fit after the prompt. Returns the finish reason and tokens produced.
fn drive<T, S>(
    source: &mut T,
    max_tokens: u32,
    room: u32,
    stop_words: &[String],
    sink: &mut S,
) -> Result<(FinishReason, u32)>
where
    T: TokenSource,
    S: TokenSink + ?Sized,
{
    let mut emitter = PieceEmitter::new(stop_words);
    let mut produced = 0u32;

    let reason = loop {
        if produced >= max_tokens {
            break FinishReason::Length;
        }
        let Some(bytes) = source.next_token()? else {
            break FinishReason::Stop;
        };
        produced += 1;

        if let Some(reason) = emitter.token(&bytes, sink) {
            break reason;
        }
        // The token just emitted still needs a KV slot before sampling on.
        if produced > room {
            break FinishReason::ContextFull;
        }
        source.advance()?;
    };

    if reason == FinishReason::Cancelled {
        debug!("Generation cancelled by sink");
    }
    emitter.finish(&reason, sink);
    Ok((reason, produced))
}

/// Turns raw token bytes into sink calls: whole UTF-8 characters only,
/// nothing that could belong to a stop word.
struct PieceEmitter {
    utf8: Utf8Assembler,
    stops: StopMatcher,
}

impl PieceEmitter {
    fn new(stop_words: &[String]) -> Self {
        Self {
            utf8: Utf8Assembler::default(),
            stops: StopMatcher::new(stop_words),
        }
    }

    /// Emit what one token makes available. Returns a finish reason when
    /// the sink refuses more text or a stop word completes.
    fn token<S: TokenSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) -> Option<FinishReason> {
        let text = self.utf8.push(bytes);
        let (emit, hit) = self.stops.push(&text);
        if !emit.is_empty() && !sink.piece(&emit) {
            return Some(FinishReason::Cancelled);
        }
        hit.map(FinishReason::StopWord)
    }

    /// Release held-back text, except after a stop word or cancellation.
    fn finish<S: TokenSink + ?Sized>(mut self, reason: &FinishReason, sink: &mut S) {
        if matches!(reason, FinishReason::StopWord(_) | FinishReason::Cancelled) {
            return;
        }
        let (emit, hit) = self.stops.push(&self.utf8.finish());
        let tail = if hit.is_some() {
            emit
        } else {
            emit + &self.stops.finish()
        };
        if !tail.is_empty() {
            sink.piece(&tail);
        }
    }
}

/// Decode `tokens` in `n_batch`-sized chunks, requesting logits only for
/// the final position. Returns that position's index within the last batch.
fn decode_prompt(ctx: &mut LlamaContext, tokens: &[i32]) -> Result<i32> {
    if tokens.is_empty() {
        return Err(LlamaError::TokenizationFailed(
            "prompt produced no tokens".into(),
        ));
    }
    let n_ctx = ctx.n_ctx();
    if tokens.len() >= n_ctx as usize {
        return Err(LlamaError::ContextOverflow {
            prompt: tokens.len(),
            n_ctx,
        });
    }

    let chunk = (ctx.n_batch() as usize).max(1);
    let mut batch = LlamaBatch::new(chunk.min(tokens.len()) as i32);
    for (c, piece) in tokens.chunks(chunk).enumerate() {
        batch.clear();
        let base = c * chunk;
        for (i, &tok) in piece.iter().enumerate() {
            let pos = base + i;
            batch.push(tok, pos as i32, pos == tokens.len() - 1)?;
        }
        trace!(chunk = c, n = piece.len(), "Decoding prompt chunk");
        ctx.decode(&mut batch)?;
    }
    Ok(batch.n_tokens() - 1)
}

/// Decode `tokens` from a clean cache and check that the model produced a
/// full row of finite logits. Returns the vocabulary size.
pub fn smoke_check(ctx: &mut LlamaContext, tokens: &[i32]) -> Result<usize> {
    ctx.kv_cache_clear();
    let idx = decode_prompt(ctx, tokens)?;
    let logits = ctx.logits_ith(idx).ok_or(LlamaError::MissingLogits(idx))?;
    if logits.is_empty() {
        return Err(LlamaError::MissingLogits(idx));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(LlamaError::NonFiniteLogits);
    }
    let n = logits.len();
    ctx.kv_cache_clear();
    Ok(n)
}

/// Events sent to an async consumer while generation runs on a blocking
/// thread.
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    Token(String),
    Done(GenerateOutcome),
    Error(String),
}

/// Sink forwarding pieces into a Tokio channel from a blocking thread.
/// A dropped receiver cancels generation.
pub struct ChannelSink(pub mpsc::Sender<GenerateEvent>);

impl TokenSink for ChannelSink {
    fn piece(&mut self, text: &str) -> bool {
        self.0
            .blocking_send(GenerateEvent::Token(text.to_string()))
            .is_ok()
    }
}
