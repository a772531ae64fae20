//! Streaming sliding-window text chunker.
//!
//! Text arrives in arbitrary pieces (whatever the file reader produced) and
//! leaves as [`TextChunk`]s of exactly [`CHUNK_SIZE`] characters, each one
//! starting with the last [`CHUNK_OVERLAP`] characters of its predecessor.
//! The final chunk may be shorter. Sizes are counted in Unicode scalar
//! values, never bytes, so a chunk boundary never splits a character.
//!
//! # Algorithm
//!
//! 1. Append each incoming piece to a buffer.
//! 2. While the buffer holds at least `size` characters, emit its first
//!    `size` characters and drop all but the trailing `overlap` of them.
//! 3. On [`StreamChunker::finish`], emit what is left unless it is only the
//!    overlap already carried from the previous chunk.
//!
//! Concatenating chunk 0 with every later chunk minus its first `overlap`
//! characters reproduces the input exactly.
//!
//! # Example
//!
//! ```rust
//! use knowledge_engine_core::chunk::StreamChunker;
//!
//! let mut chunker = StreamChunker::new(10, 2);
//! let mut chunks = chunker.push("abcdefghij");
//! chunks.extend(chunker.push("klmn"));
//! chunks.extend(chunker.finish());
//! assert_eq!(chunks[0].content, "abcdefghij");
//! assert_eq!(chunks[1].content, "ijklmn");
//! ```

/// Target characters per chunk.
pub const CHUNK_SIZE: usize = 2000;

/// Characters carried from the end of one chunk into the start of the next.
pub const CHUNK_OVERLAP: usize = 200;

/// A chunk produced by [`StreamChunker`], numbered from 0 without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: i64,
    pub content: String,
}

/// Incremental chunker over a stream of decoded text.
#[derive(Debug)]
pub struct StreamChunker {
    size: usize,
    overlap: usize,
    buf: String,
    /// Byte offset in `buf` where unconsumed text starts.
    start: usize,
    /// Characters in `buf[start..]`.
    chars: usize,
    /// Leading characters of `buf[start..]` that were already emitted.
    carried: usize,
    next_index: i64,
}

impl Default for StreamChunker {
    fn default() -> Self {
        Self::new(CHUNK_SIZE, CHUNK_OVERLAP)
    }
}

impl StreamChunker {
    /// `size` is raised to at least 1 and `overlap` is capped below `size`,
    /// so every emitted chunk is non-empty and the window always advances.
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
            buf: String::new(),
            start: 0,
            chars: 0,
            carried: 0,
            next_index: 0,
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<TextChunk> {
        self.buf.push_str(text);
        self.chars += text.chars().count();

        let mut out = Vec::new();
        while self.chars >= self.size {
            out.push(self.cut());
        }

        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        out
    }

    /// Flush the trailing partial chunk, if it holds any new text.
    pub fn finish(mut self) -> Option<TextChunk> {
        if self.chars > self.carried {
            let content = self.buf[self.start..].to_string();
            Some(self.emit(content))
        } else {
            None
        }
    }

    /// Number of chunks emitted so far.
    pub fn emitted(&self) -> i64 {
        self.next_index
    }

    fn cut(&mut self) -> TextChunk {
        let window = &self.buf[self.start..];
        let end = byte_offset(window, self.size);
        let advance = self.size - self.overlap;
        let keep_from = byte_offset(window, advance);

        let content = window[..end].to_string();
        self.start += keep_from;
        self.chars -= advance;
        self.carried = self.overlap;
        self.emit(content)
    }

    fn emit(&mut self, content: String) -> TextChunk {
        let chunk = TextChunk {
            index: self.next_index,
            content,
        };
        self.next_index += 1;
        chunk
    }
}

/// Chunk a complete string in one call (used for notes).
pub fn chunk_text(text: &str) -> Vec<TextChunk> {
    let mut chunker = StreamChunker::default();
    let mut chunks = chunker.push(text);
    chunks.extend(chunker.finish());
    chunks
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Incremental UTF-8 decoder for byte streams read in fixed-size buffers.
///
/// A multi-byte sequence split across two reads is held back until the rest
/// arrives. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let joined;
        let input: &[u8] = if self.pending.is_empty() {
            bytes
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(bytes);
            joined = buf;
            &joined
        };

        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// End of stream: a dangling partial sequence becomes one U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[TextChunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&c.content);
            } else {
                out.extend(c.content.chars().skip(overlap));
            }
        }
        out
    }

    fn run(text: &str, piece: usize, size: usize, overlap: usize) -> Vec<TextChunk> {
        let mut chunker = StreamChunker::new(size, overlap);
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        for part in chars.chunks(piece.max(1)) {
            let s: String = part.iter().collect();
            chunks.extend(chunker.push(&s));
        }
        chunks.extend(chunker.finish());
        chunks
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("").is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn exact_window_does_not_emit_overlap_only_tail() {
        let chunks = run(&"a".repeat(10), 3, 10, 2);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn indices_are_contiguous_and_sizes_bounded() {
        let text: String = (0..5000).map(|i| format!("w{} ", i)).collect();
        let chunks = run(&text, 777, CHUNK_SIZE, CHUNK_OVERLAP);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
            assert!(!c.content.is_empty());
            assert!(c.content.chars().count() <= CHUNK_SIZE);
        }
        for c in &chunks[..chunks.len() - 1] {
            assert_eq!(c.content.chars().count(), CHUNK_SIZE);
        }
    }

    #[test]
    fn reassembly_reproduces_input_regardless_of_piece_size() {
        let text: String = "Lorem ipsum dolor sit amet ~ ünïcödé ✓ 漢字. ".repeat(300);
        for piece in [1, 7, 64, 4096, 100_000] {
            let chunks = run(&text, piece, 500, 50);
            assert_eq!(reassemble(&chunks, 50), text, "piece size {}", piece);
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let text: String = (0..3000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = run(&text, 100, 1000, 100);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].content.chars().skip(900).collect();
            let head: String = pair[1].content.chars().take(100).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn overlap_is_capped_below_size() {
        let chunks = run("abcdefgh", 1, 3, 10);
        assert_eq!(reassemble(&chunks, 2), "abcdefgh");
    }

    #[test]
    fn decoder_handles_split_multibyte_sequences() {
        let bytes = "héllo ✓ wörld".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo ✓ wörld");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(&[b'a', 0xFF, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE2, 0x9C]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
