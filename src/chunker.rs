//! Text chunking strategies.
//!
//! Strategies are registered by name at process start; request `strategy`
//! fields look the implementation up in the registry. All strategies preserve
//! document order and never drop non-whitespace text.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub content: String,
    pub strategy: String,
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub source_url: Option<String>,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    pub chunk_id: String,
    pub text: String,
    pub token_count: usize,
    pub embedding_stored: bool,
    pub source_url: Option<String>,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
}

pub trait ChunkStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Split `content` into ordered pieces. `max_size` and `overlap` are
    /// interpreted per strategy (characters or tokens).
    fn split(&self, content: &str, max_size: usize, overlap: usize) -> Vec<String>;
}

pub struct ChunkerRegistry {
    strategies: HashMap<&'static str, Arc<dyn ChunkStrategy>>,
}

impl Default for ChunkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkerRegistry {
    pub fn new() -> Self {
        let mut strategies: HashMap<&'static str, Arc<dyn ChunkStrategy>> = HashMap::new();
        for strategy in [
            Arc::new(SentenceChunker) as Arc<dyn ChunkStrategy>,
            Arc::new(SemanticChunker),
            Arc::new(TokenChunker),
        ] {
            strategies.insert(strategy.name(), strategy);
        }
        Self { strategies }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.strategies.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn chunk(&self, request: &ChunkRequest) -> Result<Vec<ContentChunk>> {
        if request.content.trim().is_empty() {
            return Err(Error::invalid_input("content is empty").with_detail("reason", "empty_content"));
        }
        if request.max_chunk_size == 0 {
            return Err(Error::invalid_input("maxChunkSize must be >= 1")
                .with_detail("reason", "invalid_bounds"));
        }
        if request.overlap >= request.max_chunk_size {
            return Err(
                Error::invalid_input("overlap must be smaller than maxChunkSize")
                    .with_detail("reason", "invalid_bounds"),
            );
        }
        let strategy = self.strategies.get(request.strategy.as_str()).ok_or_else(|| {
            Error::invalid_input(format!("unknown chunk strategy '{}'", request.strategy))
                .with_detail("known", self.names())
        })?;

        let created_at = Utc::now();
        let pieces = strategy.split(&request.content, request.max_chunk_size, request.overlap);
        let chunks = pieces
            .into_iter()
            .filter(|piece| !piece.trim().is_empty())
            .enumerate()
            .map(|(index, text)| ContentChunk {
                chunk_id: chunk_id(&request.namespace, request.source_url.as_deref(), index, &text),
                token_count: text.split_whitespace().count(),
                embedding_stored: false,
                source_url: request.source_url.clone(),
                namespace: request.namespace.clone(),
                created_at,
                text,
            })
            .collect();
        Ok(chunks)
    }
}

/// Content-addressed id: namespace, source, ordinal, and text hashed together.
fn chunk_id(namespace: &str, source_url: Option<&str>, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0]);
    hasher.update(source_url.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(index.to_le_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sentences(content: &str) -> Vec<&str> {
    content
        .split_sentence_bounds()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Unicode-aware sentence packing, measured in characters.
///
/// Overlap follows sentence-count semantics: any non-zero `overlap` seeds the
/// next buffer with the last sentence of the emitted chunk, regardless of its
/// character length.
pub struct SentenceChunker;

impl ChunkStrategy for SentenceChunker {
    fn name(&self) -> &'static str {
        "sentence"
    }

    fn split(&self, content: &str, max_size: usize, overlap: usize) -> Vec<String> {
        pack_sentences(&sentences(content), max_size, overlap)
    }
}

fn pack_sentences(sentences: &[&str], max_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut buffer_len = 0usize;

    for sentence in sentences {
        let sentence_len = sentence.trim_end().len();
        if !buffer.is_empty() && buffer_len + sentence_len > max_size {
            chunks.push(join_sentences(&buffer));
            let seed = *buffer.last().expect("buffer is non-empty");
            buffer.clear();
            buffer_len = 0;
            if overlap > 0 && seed.trim_end().len() < max_size {
                buffer.push(seed);
                buffer_len = seed.trim_end().len();
            }
        }
        buffer.push(sentence);
        buffer_len += sentence_len;
    }
    if !buffer.is_empty() {
        chunks.push(join_sentences(&buffer));
    }
    chunks
}

fn join_sentences(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out
}

/// Paragraph packing on blank-line boundaries; oversize paragraphs fall back
/// to sentence packing, with surplus carrying into the next group.
pub struct SemanticChunker;

impl ChunkStrategy for SemanticChunker {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn split(&self, content: &str, max_size: usize, _overlap: usize) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut buffer = String::new();

        let mut flush = |buffer: &mut String, chunks: &mut Vec<String>| {
            if !buffer.is_empty() {
                chunks.push(std::mem::take(buffer));
            }
        };

        let mut append = |piece: &str, buffer: &mut String, chunks: &mut Vec<String>| {
            let piece = piece.trim();
            if piece.is_empty() {
                return;
            }
            let extra = if buffer.is_empty() { 0 } else { 2 };
            if !buffer.is_empty() && buffer.len() + extra + piece.len() > max_size {
                chunks.push(std::mem::take(buffer));
            }
            if !buffer.is_empty() {
                buffer.push_str("\n\n");
            }
            buffer.push_str(piece);
        };

        for paragraph in content.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if paragraph.len() > max_size {
                for sentence in sentences(paragraph) {
                    append(sentence, &mut buffer, &mut chunks);
                }
            } else {
                append(paragraph, &mut buffer, &mut chunks);
            }
        }
        flush(&mut buffer, &mut chunks);
        chunks
    }
}

/// Whitespace-token windows of `max_size` tokens with `overlap` repeated.
pub struct TokenChunker;

impl ChunkStrategy for TokenChunker {
    fn name(&self) -> &'static str {
        "token"
    }

    fn split(&self, content: &str, max_size: usize, overlap: usize) -> Vec<String> {
        let tokens: Vec<&str> = content.split_whitespace().collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        // Cap effective overlap below 100% so every window makes progress.
        let overlap = overlap.min(max_size - 1);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + max_size).min(tokens.len());
            chunks.push(tokens[start..end].join(" "));
            if end == tokens.len() {
                break;
            }
            start = end - overlap;
        }
        chunks
    }
}
