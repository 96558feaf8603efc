//! Sentence assembly: encoding word lists and incrementally decoding a byte
//! stream back into sentences.
//!
//! A sentence is an ordered word sequence terminated by an empty word.  The
//! decoder is a rolling buffer: it tolerates partial headers and partial
//! words (returning "not yet" rather than an error) so it can sit directly
//! on a TCP read loop.

use crate::word::{FrameError, decode_length, encode_word};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `words` as one wire sentence, including the empty terminator word.
pub fn encode_sentence<W: AsRef<[u8]>>(words: &[W]) -> Vec<u8> {
    let mut out = Vec::new();
    for w in words {
        encode_word(w.as_ref(), &mut out);
    }
    out.push(0x00);
    out
}

// ---------------------------------------------------------------------------
// Incremental decoder
// ---------------------------------------------------------------------------

/// Incremental sentence decoder over a growable byte buffer.
///
/// Feed bytes with [`SentenceDecoder::push_bytes`], then drain complete
/// sentences with [`SentenceDecoder::next_sentence`].  Feeding one byte at a
/// time yields the same sentence sequence as feeding whole buffers.
#[derive(Debug, Default)]
pub struct SentenceDecoder {
    buf: Vec<u8>,
    /// Consumed prefix of `buf`; compacted when a read stalls.
    offset: usize,
    /// Words of the sentence currently being assembled.
    partial: Vec<Vec<u8>>,
}

impl SentenceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw stream bytes to the decode buffer.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to produce the next complete sentence.
    ///
    /// Returns `Ok(None)` when the buffered bytes end mid-header or mid-word;
    /// the remainder is kept for the next call.  A `FrameError` is fatal for
    /// the stream: the buffer contents are no longer meaningful.
    pub fn next_sentence(&mut self) -> Result<Option<Vec<Vec<u8>>>, FrameError> {
        loop {
            let rest = &self.buf[self.offset..];
            let Some((len, header)) = decode_length(rest)? else {
                self.compact();
                return Ok(None);
            };
            if len == 0 {
                // Empty word: sentence terminator.
                self.offset += header;
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
            let total = header + len as usize;
            if rest.len() < total {
                self.compact();
                return Ok(None);
            }
            self.partial.push(rest[header..total].to_vec());
            self.offset += total;
        }
    }

    fn compact(&mut self) {
        if self.offset > 0 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
    }
}
