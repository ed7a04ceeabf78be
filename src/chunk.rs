//! Token-budgeted chunking of rendered source segments.
//!
//! Pages are preferred as a single record when their rendered text fits the
//! token budget. Oversized content splits on paragraph boundaries first, then
//! sentences, then words; consecutive chunks share an overlap of
//! `max(0, min(chunk_size - 1, round(chunk_size * overlap_ratio)))` tokens.

use crate::config::ChunkConfig;
use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static TOKENIZER: Lazy<CoreBPE> =
    Lazy::new(|| cl100k_base().expect("cl100k_base tokenizer unavailable"));

/// Count tokens for budget decisions.
pub fn count_tokens(text: &str) -> usize {
    TOKENIZER.encode_with_special_tokens(text).len()
}

/// One rendered, block-typed text segment produced by a provider renderer.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Provider block type, e.g. `heading_1`, `paragraph`.
    pub block_type: String,
    /// Nesting depth in the source block tree.
    pub depth: u32,
    /// Rendered (markdown-annotated) text.
    pub text: String,
}

impl Segment {
    pub fn new(block_type: impl Into<String>, depth: u32, text: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            depth,
            text: text.into(),
        }
    }

    /// Sparse marker injected before the segment text, e.g. `[[H1]]`.
    pub fn marker(&self) -> &'static str {
        marker_for(&self.block_type)
    }
}

/// Marker tag for a provider block type.
pub fn marker_for(block_type: &str) -> &'static str {
    match block_type {
        "heading_1" => "H1",
        "heading_2" | "child_page" => "H2",
        "heading_3" => "H3",
        "bulleted_list_item" | "numbered_list_item" | "to_do" | "toggle" => "LI",
        "quote" | "callout" => "Q",
        "code" => "CODE",
        "equation" => "EQ",
        "divider" => "HR",
        "table" | "table_row" => "TBL",
        _ => "P",
    }
}

/// Span of one segment inside an assembled chunk.
#[derive(Debug, Clone)]
pub struct SegmentSpan {
    pub block_type: String,
    pub marker: String,
    pub depth: u32,
    /// Character offset of the segment (its marker) within the chunk text.
    pub start: u32,
}

/// One assembled chunk ready to become a `SourceRecord`.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub spans: Vec<SegmentSpan>,
}

/// Turn plain text into paragraph segments (used by the Drive pipeline).
pub fn segments_from_plain_text(text: &str) -> Vec<Segment> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Segment::new("paragraph", 0, p))
        .collect()
}

/// Assemble segments into token-budgeted chunks with markers and overlap.
///
/// Whitespace-only segments are dropped. Returns an empty list when nothing
/// textual remains, which callers report as a skipped source.
pub fn assemble_chunks(segments: &[Segment], config: &ChunkConfig) -> Vec<ChunkDraft> {
    let units = build_units(segments, config.chunk_size);
    if units.is_empty() {
        return Vec::new();
    }

    let overlap = config.overlap();
    let mut chunks: Vec<ChunkDraft> = Vec::new();
    let mut current = ChunkBuilder::new();

    for unit in units {
        let unit_tokens = count_tokens(&unit.annotated);
        if !current.is_empty() && current.tokens + unit_tokens > config.chunk_size {
            let finished = current.finish();
            let carry = overlap_prefix(&finished.text, overlap)
                .trim_start()
                .to_string();
            chunks.push(finished);
            current = ChunkBuilder::with_prefix(carry);
        }
        current.push(unit);
    }
    if !current.is_empty() {
        chunks.push(current.finish());
    }

    chunks
}

/// A single packable unit: one segment, or one piece of an oversized segment.
struct Unit {
    block_type: String,
    marker: &'static str,
    depth: u32,
    /// Text with the `[[MARKER]]` prefix applied.
    annotated: String,
}

fn build_units(segments: &[Segment], budget: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let marker = segment.marker();
        for piece in split_to_budget(text, budget.saturating_sub(4).max(1)) {
            units.push(Unit {
                block_type: segment.block_type.clone(),
                marker,
                depth: segment.depth,
                annotated: format!("[[{marker}]] {piece}"),
            });
        }
    }
    units
}

/// Split text so every piece fits the token budget: paragraphs first, then
/// sentences, then words.
fn split_to_budget(text: &str, budget: usize) -> Vec<String> {
    if count_tokens(text) <= budget {
        return vec![text.to_string()];
    }

    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() > 1 {
        return pack_pieces(&paragraphs, "\n\n", budget);
    }

    let sentences = split_sentences(text);
    if sentences.len() > 1 {
        return pack_pieces(&sentences.iter().map(String::as_str).collect::<Vec<_>>(), " ", budget);
    }

    // A single unbreakable sentence: fall back to word packing.
    let words: Vec<&str> = text.split_whitespace().collect();
    pack_pieces(&words, " ", budget)
}

/// Greedily pack pieces into budget-sized strings, recursing when a single
/// piece is itself too large.
fn pack_pieces(pieces: &[&str], separator: &str, budget: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for piece in pieces {
        let piece_tokens = count_tokens(piece);
        if piece_tokens > budget {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            out.extend(split_to_budget(piece, budget));
            continue;
        }
        if !current.is_empty() && current_tokens + piece_tokens > budget {
            out.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push_str(separator);
        }
        current.push_str(piece);
        current_tokens += piece_tokens;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// The decoded last `overlap` tokens of `text`, carried into the next chunk.
pub fn overlap_prefix(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let tokens = TOKENIZER.encode_with_special_tokens(text);
    if tokens.is_empty() {
        return String::new();
    }
    let start = tokens.len().saturating_sub(overlap);
    TOKENIZER.decode(tokens[start..].to_vec()).unwrap_or_default()
}

struct ChunkBuilder {
    text: String,
    tokens: usize,
    spans: Vec<SegmentSpan>,
    has_units: bool,
}

impl ChunkBuilder {
    fn new() -> Self {
        Self {
            text: String::new(),
            tokens: 0,
            spans: Vec::new(),
            has_units: false,
        }
    }

    /// Start a chunk with overlap text carried from the previous one.
    fn with_prefix(prefix: String) -> Self {
        let tokens = if prefix.is_empty() { 0 } else { count_tokens(&prefix) };
        Self {
            text: prefix,
            tokens,
            spans: Vec::new(),
            has_units: false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.has_units
    }

    fn push(&mut self, unit: Unit) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        let start = self.text.chars().count() as u32;
        self.text.push_str(&unit.annotated);
        self.tokens += count_tokens(&unit.annotated);
        self.spans.push(SegmentSpan {
            block_type: unit.block_type,
            marker: unit.marker.to_string(),
            depth: unit.depth,
            start,
        });
        self.has_units = true;
    }

    fn finish(self) -> ChunkDraft {
        ChunkDraft {
            text: self.text,
            spans: self.spans,
        }
    }
}
