//! Text assembly for streamed output: UTF-8 reassembly across token
//! boundaries and stop-word hold-back.

/// Re-joins multi-byte characters that llama.cpp splits across tokens.
///
/// Bytes are buffered until they form complete UTF-8 sequences; invalid
/// sequences become U+FFFD. Never returns a partial character.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    /// Feed raw token bytes, returning whatever is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete tail; wait for the next token.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Withholds text that might be the start of a stop word, so a stop word
/// is never partially delivered to the consumer.
#[derive(Debug)]
pub struct StopMatcher {
    words: Vec<String>,
    held: String,
}

impl StopMatcher {
    pub fn new(words: &[String]) -> Self {
        Self {
            words: words.iter().filter(|w| !w.is_empty()).cloned().collect(),
            held: String::new(),
        }
    }

    /// Add `text`. Returns the text that is safe to emit and, if a stop
    /// word completed, that word. Text after the stop word is dropped.
    pub fn push(&mut self, text: &str) -> (String, Option<String>) {
        if self.words.is_empty() {
            return (text.to_string(), None);
        }
        self.held.push_str(text);

        let earliest = self
            .words
            .iter()
            .filter_map(|w| self.held.find(w.as_str()).map(|at| (at, w)))
            .min_by_key(|(at, _)| *at);
        if let Some((at, word)) = earliest {
            let word = word.clone();
            let emit = self.held[..at].to_string();
            self.held.clear();
            return (emit, Some(word));
        }

        let keep = self.partial_suffix_len();
        let cut = self.held.len() - keep;
        let emit = self.held[..cut].to_string();
        self.held.drain(..cut);
        (emit, None)
    }

    /// Release held text at end of stream.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// Length of the longest suffix of `held` that is a proper prefix of a
    /// stop word.
    fn partial_suffix_len(&self) -> usize {
        let held = self.held.as_str();
        held.char_indices()
            .map(|(i, _)| &held[i..])
            .find(|tail| self.words.iter().any(|w| w.starts_with(tail)))
            .map_or(0, str::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_character_is_held_until_complete() {
        let mut asm = Utf8Assembler::default();
        let bytes = "é€".as_bytes(); // c3 a9 e2 82 ac
        assert_eq!(asm.push(&bytes[..1]), "");
        assert!(asm.has_pending());
        assert_eq!(asm.push(&bytes[1..3]), "é");
        assert_eq!(asm.push(&bytes[3..4]), "");
        assert_eq!(asm.push(&bytes[4..]), "€");
        assert!(!asm.has_pending());
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut asm = Utf8Assembler::default();
        assert_eq!(asm.push(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn dangling_bytes_are_flushed_lossily() {
        let mut asm = Utf8Assembler::default();
        assert_eq!(asm.push(b"ok\xe2\x82"), "ok");
        assert_eq!(asm.finish(), "\u{FFFD}");
        assert_eq!(asm.finish(), "");
    }

    #[test]
    fn no_stop_words_passes_text_through() {
        let mut stops = StopMatcher::new(&[]);
        assert_eq!(stops.push("hello"), ("hello".to_string(), None));
    }

    #[test]
    fn stop_word_split_across_pieces_is_never_emitted() {
        let mut stops = StopMatcher::new(&["</s>".to_string()]);
        assert_eq!(stops.push("Hi <"), ("Hi ".to_string(), None));
        assert_eq!(stops.push("/"), (String::new(), None));
        assert_eq!(stops.push("s> trailing"), (String::new(), Some("</s>".to_string())));
    }

    #[test]
    fn false_start_is_released() {
        let mut stops = StopMatcher::new(&["User:".to_string()]);
        assert_eq!(stops.push("Us"), (String::new(), None));
        assert_eq!(stops.push("ually"), ("Usually".to_string(), None));
        assert_eq!(stops.finish(), "");
    }

    #[test]
    fn earliest_stop_word_wins() {
        let mut stops = StopMatcher::new(&["bb".to_string(), "a".to_string()]);
        let (emit, hit) = stops.push("xbbya");
        assert_eq!(emit, "x");
        assert_eq!(hit.as_deref(), Some("bb"));
    }

    #[test]
    fn held_prefix_is_flushed_at_end() {
        let mut stops = StopMatcher::new(&["###".to_string()]);
        assert_eq!(stops.push("done ##"), ("done ".to_string(), None));
        assert_eq!(stops.finish(), "##");
    }
}
