//! Heading-aware Markdown chunking.
//!
//! Text is split into blocks on blank lines (code fences stay whole), blocks
//! are packed into chunks of at most `chunk_size` characters, and a chunk
//! never spans two sections. Consecutive chunks of one section share up to
//! `overlap` trailing characters.

use librarian_shared::TextChunk;

/// Split Markdown into chunks.
pub fn chunk_markdown(markdown: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size / 2);

    let mut builder = ChunkBuilder {
        chunks: Vec::new(),
        current: String::new(),
        section: None,
        chunk_size,
        overlap,
    };

    for (section, block) in blocks(markdown) {
        builder.push_block(section, &block);
    }
    builder.flush(false);
    builder.chunks
}

struct ChunkBuilder {
    chunks: Vec<TextChunk>,
    current: String,
    section: Option<String>,
    chunk_size: usize,
    overlap: usize,
}

impl ChunkBuilder {
    fn push_block(&mut self, section: Option<String>, block: &str) {
        if section != self.section {
            self.flush(false);
            self.section = section;
        }

        let block_len = char_len(block);
        if block_len > self.chunk_size {
            self.flush(true);
            for piece in split_long(block, self.chunk_size, self.overlap) {
                self.current = piece;
                self.flush(false);
            }
            return;
        }

        let sep = if self.current.is_empty() { 0 } else { 2 };
        if char_len(&self.current) + sep + block_len > self.chunk_size {
            self.flush(true);
            if char_len(&self.current) + 2 + block_len > self.chunk_size {
                self.current.clear();
            }
        }
        if !self.current.is_empty() {
            self.current.push_str("\n\n");
        }
        self.current.push_str(block);
    }

    /// Emit the current chunk. With `carry`, keep its tail as the start of
    /// the next one.
    fn flush(&mut self, carry: bool) {
        let text = self.current.trim();
        if text.is_empty() {
            self.current.clear();
            return;
        }
        self.chunks.push(TextChunk {
            index: self.chunks.len(),
            section: self.section.clone(),
            text: text.to_string(),
        });
        self.current = if carry && self.overlap > 0 {
            tail(text, self.overlap).trim_start().to_string()
        } else {
            String::new()
        };
    }
}

/// Blocks of the document with the heading path they sit under.
fn blocks(markdown: &str) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut block = String::new();
    let mut in_fence = false;

    let section_of = |headings: &[(usize, String)]| {
        if headings.is_empty() {
            None
        } else {
            Some(
                headings
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
            )
        }
    };

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            push_line(&mut block, line);
            continue;
        }
        if in_fence {
            push_line(&mut block, line);
            continue;
        }

        if let Some((level, title)) = heading(trimmed) {
            if !block.trim().is_empty() {
                out.push((section_of(&headings), std::mem::take(&mut block)));
            }
            block.clear();
            headings.retain(|(l, _)| *l < level);
            headings.push((level, title));
            push_line(&mut block, line);
            continue;
        }

        if line.trim().is_empty() {
            if !block.trim().is_empty() {
                out.push((section_of(&headings), std::mem::take(&mut block)));
            }
            block.clear();
            continue;
        }
        push_line(&mut block, line);
    }
    if !block.trim().is_empty() {
        out.push((section_of(&headings), block));
    }
    out
}

fn push_line(block: &mut String, line: &str) {
    if !block.is_empty() {
        block.push('\n');
    }
    block.push_str(line);
}

/// `(level, title)` of an ATX heading line.
fn heading(line: &str) -> Option<(usize, String)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    (!title.is_empty()).then_some((level, title))
}

/// Hard-split an oversized block into overlapping windows.
fn split_long(block: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = block.chars().collect();
    let step = size - overlap;
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`.
fn tail(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if len <= n {
        return s;
    }
    let skip = len - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
