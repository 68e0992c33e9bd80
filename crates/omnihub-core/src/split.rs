//! Outbound auto-split.
//!
//! Long agent replies are split on paragraph boundaries first, then
//! sentence boundaries, and only hard-cut as a last resort. Fenced code
//! blocks are kept intact so a split never breaks markdown rendering.

/// Split `text` into chunks of at most `limit` characters.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut String, current_len: &mut usize, chunks: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        current.clear();
        *current_len = 0;
    };

    for segment in segment_blocks(text) {
        let segment_len = segment.chars().count();
        let sep_len = if current_len == 0 { 0 } else { 2 };

        if current_len + sep_len + segment_len <= limit {
            if current_len > 0 {
                current.push_str("\n\n");
            }
            current.push_str(&segment);
            current_len += sep_len + segment_len;
            continue;
        }

        flush(&mut current, &mut current_len, &mut chunks);

        if segment_len <= limit {
            current.push_str(&segment);
            current_len = segment_len;
            continue;
        }

        // A single oversized segment: sentence-split, hard-cut as needed.
        // Oversized code fences are hard-cut too; mangling one fence beats
        // dropping the reply.
        for piece in split_sentences(&segment, limit) {
            let piece_len = piece.chars().count();
            let sep = if current_len == 0 { 0 } else { 1 };
            if current_len + sep + piece_len <= limit {
                if current_len > 0 {
                    current.push(' ');
                }
                current.push_str(&piece);
                current_len += sep + piece_len;
            } else {
                flush(&mut current, &mut current_len, &mut chunks);
                current.push_str(&piece);
                current_len = piece_len;
            }
        }
        flush(&mut current, &mut current_len, &mut chunks);
    }

    flush(&mut current, &mut current_len, &mut chunks);
    chunks
}

/// Break text into paragraph segments, keeping fenced code blocks as a
/// single segment.
fn segment_blocks(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let is_fence_marker = line.trim_start().starts_with("```");

        if in_fence {
            current.push('\n');
            current.push_str(line);
            if is_fence_marker {
                in_fence = false;
                segments.push(current.clone());
                current.clear();
            }
            continue;
        }

        if is_fence_marker {
            if !current.trim().is_empty() {
                segments.push(current.trim().to_string());
            }
            current = line.to_string();
            in_fence = true;
            continue;
        }

        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                segments.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }
    segments
}

fn split_sentences(text: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for sentence in sentence_iter(text) {
        if sentence.chars().count() > limit {
            if !current.trim().is_empty() {
                pieces.push(current.trim().to_string());
                current.clear();
            }
            pieces.extend(hard_split(&sentence, limit));
            continue;
        }
        if current.chars().count() + sentence.chars().count() > limit {
            if !current.trim().is_empty() {
                pieces.push(current.trim().to_string());
            }
            current = sentence;
        } else {
            current.push_str(&sentence);
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

fn sentence_iter(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|next| next.is_whitespace()) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

fn hard_split(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit.max(1))
        .map(|c| c.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
