//! Chunk types and input splitting
//!
//! Divides a string, array, or byte buffer into an ordered sequence of
//! bounded-size units along logical boundaries where possible. All splitters
//! are pure functions: chunks come out in strictly increasing index order and
//! concatenating their payloads in that order reproduces the input exactly.
//!
//! Text is split at paragraph breaks first; pieces that still exceed the
//! bound are re-split at sentence boundaries, and a single oversized sentence
//! falls back to fixed-size character slices. Adjacent small pieces are
//! greedily packed together so the chunk count stays low without ever
//! violating the size bound.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Boundary after a blank line, possibly containing whitespace
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("Valid regex pattern"));

/// Boundary after sentence punctuation followed by whitespace
static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+\s+").expect("Valid regex pattern"));

/// One bounded-size unit of input, tagged with its position in the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk<T> {
    /// Zero-based position within the original input
    pub index: usize,
    pub payload: T,
}

impl<T> Chunk<T> {
    pub fn new(index: usize, payload: T) -> Self {
        Self { index, payload }
    }
}

/// Where the text splitter looks for logical boundaries
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    /// Blank-line paragraph breaks
    #[default]
    Paragraph,
    /// A literal separator string
    Literal(String),
}

/// Options for the text splitter
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitOptions {
    #[serde(default)]
    pub delimiter: Delimiter,
}

/// Inputs that know how to divide themselves into chunks
pub trait IntoChunks {
    type Unit;

    fn into_chunks(self, max_size: usize, options: &SplitOptions) -> Vec<Chunk<Self::Unit>>;
}

impl IntoChunks for &str {
    type Unit = String;

    fn into_chunks(self, max_size: usize, options: &SplitOptions) -> Vec<Chunk<String>> {
        split_text(self, max_size, options)
    }
}

impl IntoChunks for String {
    type Unit = String;

    fn into_chunks(self, max_size: usize, options: &SplitOptions) -> Vec<Chunk<String>> {
        split_text(&self, max_size, options)
    }
}

impl<T: Clone> IntoChunks for &[T] {
    type Unit = Vec<T>;

    fn into_chunks(self, max_size: usize, _options: &SplitOptions) -> Vec<Chunk<Vec<T>>> {
        split_slice(self, max_size)
    }
}

impl<T: Clone> IntoChunks for Vec<T> {
    type Unit = Vec<T>;

    fn into_chunks(self, max_size: usize, _options: &SplitOptions) -> Vec<Chunk<Vec<T>>> {
        split_slice(&self, max_size)
    }
}

/// Byte input whose chunk boundaries are moved back to the last newline, so
/// no chunk ends mid-line. Plain `&[T]`/`Vec<T>` input uses raw fixed ranges.
#[derive(Debug, Clone, Copy)]
pub struct NewlineAligned<'a>(pub &'a [u8]);

impl IntoChunks for NewlineAligned<'_> {
    type Unit = Vec<u8>;

    fn into_chunks(self, max_size: usize, _options: &SplitOptions) -> Vec<Chunk<Vec<u8>>> {
        split_bytes(self.0, max_size, true)
    }
}

// ============================================================================
// Text splitting
// ============================================================================

/// Split text into chunks of at most `max_size` characters.
///
/// Inputs within the bound come back as a single chunk. Empty input yields no
/// chunks. Boundary separators stay attached to the preceding piece, so the
/// payloads concatenate back to the original text.
pub fn split_text(input: &str, max_size: usize, options: &SplitOptions) -> Vec<Chunk<String>> {
    let max = max_size.max(1);
    if input.is_empty() {
        return Vec::new();
    }
    if char_len(input) <= max {
        return vec![Chunk::new(0, input.to_string())];
    }

    let mut packer = Packer::new(max);
    for piece in split_pieces(input, &options.delimiter) {
        packer.push_piece(piece);
    }
    packer.finish()
}

/// Split at logical boundaries, keeping each separator with the piece before
/// it. No boundary match means one piece: the whole input.
fn split_pieces<'a>(input: &'a str, delimiter: &Delimiter) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut prev = 0;
    match delimiter {
        Delimiter::Paragraph => {
            for m in PARAGRAPH_BREAK.find_iter(input) {
                pieces.push(&input[prev..m.end()]);
                prev = m.end();
            }
        }
        Delimiter::Literal(sep) if !sep.is_empty() => {
            for (at, _) in input.match_indices(sep.as_str()) {
                pieces.push(&input[prev..at + sep.len()]);
                prev = at + sep.len();
            }
        }
        Delimiter::Literal(_) => {}
    }
    if prev < input.len() {
        pieces.push(&input[prev..]);
    }
    pieces
}

/// Split at sentence boundaries, punctuation and trailing whitespace kept
/// with the leading sentence.
fn split_sentences(piece: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut prev = 0;
    for m in SENTENCE_BREAK.find_iter(piece) {
        sentences.push(&piece[prev..m.end()]);
        prev = m.end();
    }
    if prev < piece.len() {
        sentences.push(&piece[prev..]);
    }
    sentences
}

/// Raw fixed-size slices of at most `max` characters each.
fn char_slices(text: &str, max: usize) -> Vec<&str> {
    let mut slices = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (at, _) in text.char_indices() {
        if count == max {
            slices.push(&text[start..at]);
            start = at;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        slices.push(&text[start..]);
    }
    slices
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Greedy accumulator: pieces are appended to the current chunk while the
/// combined character count stays within the bound.
struct Packer {
    max: usize,
    chunks: Vec<Chunk<String>>,
    current: String,
    current_len: usize,
}

impl Packer {
    fn new(max: usize) -> Self {
        Self {
            max,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn push_piece(&mut self, piece: &str) {
        let len = char_len(piece);
        if len <= self.max {
            self.append(piece, len);
            return;
        }
        for sentence in split_sentences(piece) {
            let sentence_len = char_len(sentence);
            if sentence_len <= self.max {
                self.append(sentence, sentence_len);
            } else {
                // One unbreakable run of text: cut it into raw slices
                self.flush();
                for slice in char_slices(sentence, self.max) {
                    let index = self.chunks.len();
                    self.chunks.push(Chunk::new(index, slice.to_string()));
                }
            }
        }
    }

    fn append(&mut self, text: &str, len: usize) {
        if self.current_len + len > self.max {
            self.flush();
        }
        self.current.push_str(text);
        self.current_len += len;
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            let index = self.chunks.len();
            self.chunks
                .push(Chunk::new(index, std::mem::take(&mut self.current)));
            self.current_len = 0;
        }
    }

    fn finish(mut self) -> Vec<Chunk<String>> {
        self.flush();
        self.chunks
    }
}

// ============================================================================
// Array and byte splitting
// ============================================================================

/// Fixed-size slicing into contiguous sub-arrays of at most `max_size`
/// elements; the final chunk may be shorter.
pub fn split_slice<T: Clone>(items: &[T], max_size: usize) -> Vec<Chunk<Vec<T>>> {
    let max = max_size.max(1);
    items
        .chunks(max)
        .enumerate()
        .map(|(index, part)| Chunk::new(index, part.to_vec()))
        .collect()
}

/// Contiguous byte ranges of at most `max_size` bytes, covering the input
/// without gaps or overlaps.
///
/// With `align_newlines` set, any content after the last newline in a chunk
/// moves into the following chunk; a chunk with no newline at all is kept
/// whole, and the final chunk is exempt.
pub fn split_bytes(bytes: &[u8], max_size: usize, align_newlines: bool) -> Vec<Chunk<Vec<u8>>> {
    let max = max_size.max(1);
    let mut chunks = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        let mut end = (cursor + max).min(bytes.len());
        if align_newlines && end < bytes.len() {
            if let Some(at) = bytes[cursor..end].iter().rposition(|&b| b == b'\n') {
                end = cursor + at + 1;
            }
        }
        let index = chunks.len();
        chunks.push(Chunk::new(index, bytes[cursor..end].to_vec()));
        cursor = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(chunks: &[Chunk<String>]) -> String {
        chunks.iter().map(|c| c.payload.as_str()).collect()
    }

    fn opts() -> SplitOptions {
        SplitOptions::default()
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = split_text("hello world", 50, &opts());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].payload, "hello world");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_text("", 10, &opts()).is_empty());
        assert!(split_slice::<u8>(&[], 10).is_empty());
        assert!(split_bytes(&[], 10, true).is_empty());
    }

    #[test]
    fn uniform_text_falls_back_to_char_slices() {
        let input = "a".repeat(12_000);
        let chunks = split_text(&input, 5000, &opts());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.chars().count(), 5000);
        assert_eq!(chunks[1].payload.chars().count(), 5000);
        assert_eq!(chunks[2].payload.chars().count(), 2000);
        assert_eq!(join(&chunks), input);
    }

    #[test]
    fn paragraphs_pack_greedily_and_reconstruct() {
        let input = "first paragraph here\n\nsecond one\n\nthird paragraph is a bit longer\n\nlast";
        let chunks = split_text(input, 40, &opts());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.payload.chars().count() <= 40);
        }
        assert_eq!(join(&chunks), input);
        for (expected, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, expected);
        }
    }

    #[test]
    fn small_paragraphs_share_a_chunk() {
        let input = "aa\n\nbb\n\ncc";
        let chunks = split_text(input, 6, &opts());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload, "aa\n\n");
        assert_eq!(chunks[1].payload, "bb\n\ncc");
    }

    #[test]
    fn oversized_paragraph_splits_at_sentences() {
        let sentence = "This sentence is fairly long and padded out. ";
        let paragraph = sentence.repeat(4);
        let chunks = split_text(&paragraph, 100, &opts());
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.payload.chars().count() <= 100);
        }
        assert_eq!(join(&chunks), paragraph);
    }

    #[test]
    fn oversized_sentence_falls_back_to_slices() {
        let input = "x".repeat(25);
        let chunks = split_text(&input, 10, &opts());
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(join(&chunks), input);
    }

    #[test]
    fn multibyte_text_counts_characters_not_bytes() {
        let input = "é".repeat(12);
        let chunks = split_text(&input, 5, &opts());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.chars().count(), 5);
        assert_eq!(chunks[2].payload.chars().count(), 2);
        assert_eq!(join(&chunks), input);
    }

    #[test]
    fn literal_delimiter_keeps_separator_with_leading_piece() {
        let input = "one|two|three|four";
        let options = SplitOptions {
            delimiter: Delimiter::Literal("|".to_string()),
        };
        let chunks = split_text(input, 8, &options);
        for chunk in &chunks {
            assert!(chunk.payload.chars().count() <= 8);
        }
        assert_eq!(join(&chunks), input);
    }

    #[test]
    fn array_split_matches_fixed_sizes() {
        let items: Vec<u32> = (0..25).collect();
        let chunks = split_slice(&items, 10);
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        let rebuilt: Vec<u32> = chunks.into_iter().flat_map(|c| c.payload).collect();
        assert_eq!(rebuilt, items);
    }

    #[test]
    fn byte_split_covers_without_gaps() {
        let bytes: Vec<u8> = (0..=255).collect();
        let chunks = split_bytes(&bytes, 100, false);
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(),
            vec![100, 100, 56]
        );
        let rebuilt: Vec<u8> = chunks.into_iter().flat_map(|c| c.payload).collect();
        assert_eq!(rebuilt, bytes);
    }

    #[test]
    fn newline_alignment_moves_partial_lines_forward() {
        let text = b"alpha\nbravo\ncharlie\ndelta\n";
        let chunks = split_bytes(text, 10, true);
        let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c.payload.clone()).collect();
        assert_eq!(rebuilt, text);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(*chunk.payload.last().unwrap(), b'\n');
        }
    }

    #[test]
    fn alignment_keeps_newline_free_chunks_whole() {
        let bytes = b"0123456789abcdef";
        let chunks = split_bytes(bytes, 8, true);
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(),
            vec![8, 8]
        );
    }

    #[test]
    fn into_chunks_covers_every_input_kind() {
        let text_chunks = "abc".into_chunks(10, &opts());
        assert_eq!(text_chunks.len(), 1);

        let array_chunks = vec![1, 2, 3, 4].into_chunks(2, &opts());
        assert_eq!(array_chunks.len(), 2);

        let aligned = NewlineAligned(b"line one\nline two\n").into_chunks(12, &opts());
        assert!(aligned.iter().all(|c| !c.payload.is_empty()));
    }

    #[test]
    fn zero_max_size_still_terminates() {
        let chunks = split_text("abc", 0, &opts());
        assert_eq!(chunks.len(), 3);
        assert_eq!(join(&chunks), "abc");
    }
}
