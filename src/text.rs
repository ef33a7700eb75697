//! Token estimation and prompt trimming.
//!
//! Prompts are capped by an estimated token count. Oversized text is cut at
//! the coarsest natural boundary that fits (paragraph, line, word, character)
//! by recursive character splitting, then re-measured until it fits.

/// Shortest text a trim will ever return for non-empty input.
const MIN_CHUNK_CHARS: usize = 140;

/// Rough characters removed per overflowing token when picking a cut point.
const CHARS_PER_OVERFLOW_TOKEN: usize = 3;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Character-ratio token estimator tuned for GPT-family tokenizers.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    latin_chars_per_token: f64,
    cjk_chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            latin_chars_per_token: 4.0,
            cjk_chars_per_token: 1.5,
        }
    }
}

impl TokenEstimator {
    pub fn estimate(&self, text: &str) -> usize {
        let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
            if is_cjk(c) {
                (cjk + 1, other)
            } else {
                (cjk, other + 1)
            }
        });
        (cjk as f64 / self.cjk_chars_per_token).ceil() as usize
            + (other as f64 / self.latin_chars_per_token).ceil() as usize
    }

    /// Shrinks `text` until its estimate fits in `max_tokens`.
    pub fn trim(&self, text: &str, max_tokens: usize) -> String {
        if text.is_empty() {
            return String::new();
        }

        let tokens = self.estimate(text);
        if tokens <= max_tokens {
            return text.to_string();
        }

        let length = text.chars().count();
        let overflow = tokens - max_tokens;
        let chunk_size = length.saturating_sub(overflow * CHARS_PER_OVERFLOW_TOKEN);
        if chunk_size < MIN_CHUNK_CHARS {
            return take_chars(text, MIN_CHUNK_CHARS);
        }

        let trimmed = split_text(text, chunk_size, &SEPARATORS)
            .into_iter()
            .next()
            .unwrap_or_default();

        if trimmed.chars().count() >= length {
            return self.trim(&take_chars(text, chunk_size), max_tokens);
        }
        self.trim(&trimmed, max_tokens)
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF)
}

fn take_chars(text: &str, count: usize) -> String {
    text.chars().take(count).collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits `text` into chunks of at most `chunk_size` characters, preferring
/// the earliest separator in `separators` that occurs in the text.
fn split_text(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    let position = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(separator)
            .filter(|piece| !piece.is_empty())
            .map(String::from)
            .collect()
    };

    let mut chunks = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for piece in pieces {
        if char_len(&piece) <= chunk_size {
            pending.push(piece);
            continue;
        }
        chunks.extend(merge(&pending, separator, chunk_size));
        pending.clear();
        if finer.is_empty() {
            chunks.push(piece);
        } else {
            chunks.extend(split_text(&piece, chunk_size, finer));
        }
    }
    chunks.extend(merge(&pending, separator, chunk_size));
    chunks
}

fn merge(pieces: &[String], separator: &str, chunk_size: usize) -> Vec<String> {
    let separator_len = char_len(separator);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;

    for piece in pieces {
        let piece_len = char_len(piece);
        let joined_len = if current.is_empty() {
            piece_len
        } else {
            current_len + separator_len + piece_len
        };
        if joined_len > chunk_size && !current.is_empty() {
            chunks.push(current.join(separator));
            current.clear();
            current_len = 0;
        }
        current_len = if current.is_empty() {
            piece_len
        } else {
            current_len + separator_len + piece_len
        };
        current.push(piece);
    }
    if !current.is_empty() {
        chunks.push(current.join(separator));
    }
    chunks
}
