//! byte chunks -> complete text lines.
//!
//! the decoder never emits a line before its `\n` arrives and never splits a
//! utf-8 character that straddles two chunks: incomplete trailing bytes are
//! held back and prefixed to the next chunk.

/// streaming utf-8 line decoder for one in-flight response.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// decoded text after the last `\n`; never contains a `\n` between calls.
    carry: String,
    /// trailing bytes of an incomplete utf-8 sequence (at most 3).
    partial: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// decode `chunk` and return every line completed by it, in order.
    ///
    /// a `\r` right before the `\n` is stripped, so `\n` and `\r\n` framing
    /// both work.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.partial.is_empty() {
            self.decode_into_carry(chunk);
        } else {
            let mut bytes = std::mem::take(&mut self.partial);
            bytes.extend_from_slice(chunk);
            self.decode_into_carry(&bytes);
        }
        self.split_lines()
    }

    /// text (and undecoded bytes) still waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.carry.len() + self.partial.len()
    }

    /// end of stream: the unterminated tail is discarded, never flushed.
    /// returns how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending_len();
        self.carry.clear();
        self.partial.clear();
        dropped
    }

    fn decode_into_carry(&mut self, mut bytes: &[u8]) {
        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    self.carry.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, rest) = bytes.split_at(err.valid_up_to());
                    // `valid_up_to` is always a char boundary
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.carry.push_str(text);
                    }
                    match err.error_len() {
                        // invalid sequence: replace and keep going
                        Some(len) => {
                            self.carry.push(char::REPLACEMENT_CHARACTER);
                            bytes = &rest[len..];
                        }
                        // truncated sequence at the end of the chunk
                        None => {
                            self.partial.extend_from_slice(rest);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn split_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.carry.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, tail);
        complete
            .split_terminator('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }
}
