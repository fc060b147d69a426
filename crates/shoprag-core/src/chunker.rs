//! Token-window chunking with overlap.
//!
//! Tokens are maximal runs of non-whitespace characters. Chunks are byte
//! slices of the source: the first starts at byte 0, the last ends at the
//! end of the text, and every other chunk ends where its first excluded
//! token begins. Dropping each chunk's `overlap_bytes` prefix and
//! concatenating therefore reproduces the input exactly (see [`reassemble`]).
//! Form feeds (`\x0C`) separate pages.

use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::types::PageSpan;

const PAGE_BREAK: char = '\x0C';
const MAX_SECTION_TITLE_LEN: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    page: u32,
}

/// A chunk before it has an id or a vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub ordinal: usize,
    pub text: String,
    pub token_len: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub overlap_bytes: usize,
    pub pages: PageSpan,
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        if config.target_tokens == 0 {
            return Err(Error::InvalidConfig("chunking.target_tokens must be > 0".into()));
        }
        if config.overlap_tokens >= config.target_tokens {
            return Err(Error::InvalidConfig(
                "chunking.overlap_tokens must be smaller than target_tokens".into(),
            ));
        }
        Ok(Self { config })
    }

    /// Lazily splits `text`. The returned iterator is `Clone`; a clone restarts
    /// from the same position.
    pub fn split<'a>(&self, text: &'a str) -> Chunks<'a> {
        Chunks {
            text,
            tokens: tokenize(text).into(),
            config: self.config.clone(),
            next_start: 0,
            prev_end: 0,
            ordinal: 0,
            done: false,
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self { config: ChunkingConfig::default() }
    }
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    tokens: Arc<[Token]>,
    config: ChunkingConfig,
    next_start: usize,
    prev_end: usize,
    ordinal: usize,
    done: bool,
}

impl Chunks<'_> {
    /// Moves `end` back to just after the last sentence-ending token inside the
    /// final 20% of the window, as long as the chunk stays longer than the overlap.
    fn sentence_break(&self, start: usize, end: usize) -> usize {
        let window = (self.config.target_tokens / 5).max(1);
        let floor = (start + self.config.overlap_tokens + 1).max(end.saturating_sub(window));
        (floor..end)
            .rev()
            .find(|&candidate| {
                let token = self.tokens[candidate - 1];
                self.text[token.start..token.end].ends_with(['.', '!', '?'])
            })
            .unwrap_or(end)
    }
}

impl Iterator for Chunks<'_> {
    type Item = ChunkDraft;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.tokens.is_empty() {
            return None;
        }
        let n = self.tokens.len();
        let start = self.next_start;
        let mut end = (start + self.config.target_tokens).min(n);
        if end < n {
            if n - end < self.config.overlap_tokens {
                // dangling tail is merged into this chunk
                end = n;
            } else if self.config.sentence_aware {
                end = self.sentence_break(start, end);
            }
        }

        let byte_start = if self.ordinal == 0 { 0 } else { self.tokens[start].start };
        let byte_end = if end == n { self.text.len() } else { self.tokens[end].start };
        let overlap_bytes = if self.ordinal == 0 { 0 } else { self.prev_end - byte_start };
        let text = &self.text[byte_start..byte_end];

        let draft = ChunkDraft {
            ordinal: self.ordinal,
            text: text.to_string(),
            token_len: end - start,
            byte_start,
            byte_end,
            overlap_bytes,
            pages: PageSpan { first: self.tokens[start].page, last: self.tokens[end - 1].page },
            section: detect_section_title(text),
        };

        if end == n {
            self.done = true;
        } else {
            self.next_start = end - self.config.overlap_tokens;
        }
        self.prev_end = byte_end;
        self.ordinal += 1;
        Some(draft)
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut page = 1u32;
    let mut current: Option<(usize, u32)> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some((start, token_page)) = current.take() {
                tokens.push(Token { start, end: idx, page: token_page });
            }
            if ch == PAGE_BREAK {
                page += 1;
            }
        } else if current.is_none() {
            current = Some((idx, page));
        }
    }
    if let Some((start, token_page)) = current {
        tokens.push(Token { start, end: text.len(), page: token_page });
    }
    tokens
}

/// Rebuilds the source text from its chunks, in ordinal order.
pub fn reassemble(chunks: &[ChunkDraft]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&chunk.text[chunk.overlap_bytes..]);
    }
    out
}

fn heading_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"^\d+[.)]\s+", r"(?i)^chapter\s+\d+"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Heuristic heading detection on the first non-empty line: a short line that
/// is upper-case, numbered (`3. Spindle`) or starts with `Chapter N`.
pub fn detect_section_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() >= MAX_SECTION_TITLE_LEN {
        return None;
    }
    let has_letters = line.chars().any(char::is_alphabetic);
    let upper = has_letters && line.chars().filter(|c| c.is_alphabetic()).all(char::is_uppercase);
    if upper || heading_patterns().iter().any(|re| re.is_match(line)) {
        Some(line.to_string())
    } else {
        None
    }
}
