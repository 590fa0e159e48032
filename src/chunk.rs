//! Heading-aware text chunker.
//!
//! Splits document text into [`Chunk`]s for retrieval:
//!
//! - sections start at extraction-supplied headings;
//! - a section over the size limit is packed from paragraphs, then sentences,
//!   then words, so cuts land on the coarsest boundary that fits;
//! - tables (spans reported by extraction, or runs of `|`/tab-delimited lines)
//!   are never split, even when one alone exceeds the limit.
//!
//! The output is a pure function of `(text, headings, table spans, limit)`;
//! chunk indices and spans are stable across runs, which is what lets the
//! embedding stage reuse vectors by text hash.

use sha2::{Digest, Sha256};
use std::ops::Range;

use crate::models::{Chunk, Heading};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A unit of packing. Atomic units are emitted whole.
#[derive(Debug, Clone)]
struct Unit {
    range: Range<usize>,
    atomic: bool,
}

/// Split `text` into ordered chunks. `headings` and `table_spans` use
/// character offsets; returned spans are character offsets too.
pub fn chunk_document(
    text: &str,
    headings: &[Heading],
    table_spans: &[(usize, usize)],
    max_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let offsets = CharOffsets::new(text);

    let mut protected: Vec<Range<usize>> = table_spans
        .iter()
        .filter(|(s, e)| s < e)
        .map(|&(s, e)| offsets.to_byte(s)..offsets.to_byte(e))
        .filter(|r| !r.is_empty())
        .chain(detect_table_blocks(text))
        .collect();
    protected = merge_ranges(protected);

    let mut chunks = Vec::new();
    for (section, label) in sections(text, headings, &protected, &offsets) {
        for range in split_section(text, section, &protected, max_chars) {
            let Some(range) = trim_range(text, range) else {
                continue;
            };
            chunks.push(make_chunk(
                chunks.len() as i64,
                label.clone(),
                offsets.to_char(range.start),
                offsets.to_char(range.end),
                &text[range],
            ));
        }
    }
    chunks
}

fn make_chunk(index: i64, heading: Option<String>, start: usize, end: usize, text: &str) -> Chunk {
    Chunk {
        chunk_index: index,
        heading,
        start,
        end,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Byte ↔ character offset conversion for one text.
struct CharOffsets {
    boundaries: Vec<usize>,
}

impl CharOffsets {
    fn new(text: &str) -> Self {
        let mut boundaries: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        boundaries.push(text.len());
        Self { boundaries }
    }

    fn to_byte(&self, char_offset: usize) -> usize {
        self.boundaries[char_offset.min(self.boundaries.len() - 1)]
    }

    fn to_char(&self, byte_offset: usize) -> usize {
        match self.boundaries.binary_search(&byte_offset) {
            Ok(i) | Err(i) => i,
        }
    }
}

fn merge_ranges(mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    merged
}

/// Runs of two or more lines that contain `|` or a tab.
fn detect_table_blocks(text: &str) -> Vec<Range<usize>> {
    let mut blocks = Vec::new();
    let mut run: Option<Range<usize>> = None;
    let mut run_lines = 0;
    let mut pos = 0;

    for line in text.split_inclusive('\n') {
        let line_range = pos..pos + line.len();
        pos += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        let is_row = !content.trim().is_empty() && (content.contains('|') || content.contains('\t'));

        if is_row {
            let end = line_range.start + content.len();
            run = Some(match run.take() {
                Some(r) => r.start..end,
                None => line_range.start..end,
            });
            run_lines += 1;
        } else {
            if let Some(r) = run.take() {
                if run_lines >= 2 {
                    blocks.push(r);
                }
            }
            run_lines = 0;
        }
    }
    if let Some(r) = run {
        if run_lines >= 2 {
            blocks.push(r);
        }
    }
    blocks
}

/// Section byte ranges with their heading labels. Headings that fall
/// strictly inside a table are ignored.
fn sections(
    text: &str,
    headings: &[Heading],
    protected: &[Range<usize>],
    offsets: &CharOffsets,
) -> Vec<(Range<usize>, Option<String>)> {
    let mut starts: Vec<(usize, String)> = headings
        .iter()
        .map(|h| (offsets.to_byte(h.offset), h.text.trim().to_string()))
        .filter(|(b, _)| *b < text.len())
        .filter(|(b, _)| !protected.iter().any(|p| p.start < *b && *b < p.end))
        .collect();
    // Stable sort keeps the first-listed heading when two share an offset.
    starts.sort_by_key(|(b, _)| *b);
    starts.dedup_by_key(|(b, _)| *b);

    let mut out = Vec::with_capacity(starts.len() + 1);
    let first = starts.first().map(|(b, _)| *b).unwrap_or(text.len());
    if first > 0 {
        out.push((0..first, None));
    }
    for (i, (start, label)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|(b, _)| *b).unwrap_or(text.len());
        out.push((*start..end, Some(label.clone())));
    }
    out
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

fn split_section(
    text: &str,
    section: Range<usize>,
    protected: &[Range<usize>],
    max_chars: usize,
) -> Vec<Range<usize>> {
    if char_len(text, &section) <= max_chars {
        return vec![section];
    }

    let mut units = Vec::new();
    for block in paragraph_blocks(text, section, protected) {
        if block.atomic || char_len(text, &block.range) <= max_chars {
            units.push(block);
            continue;
        }
        for sentence in sentence_ranges(text, block.range) {
            if char_len(text, &sentence) <= max_chars {
                units.push(Unit {
                    range: sentence,
                    atomic: false,
                });
            } else {
                units.extend(word_ranges(text, sentence, max_chars).into_iter().map(|r| Unit {
                    range: r,
                    atomic: false,
                }));
            }
        }
    }
    pack(text, units, max_chars)
}

/// Paragraphs (blank-line separated) with table spans kept as atomic blocks.
fn paragraph_blocks(text: &str, section: Range<usize>, protected: &[Range<usize>]) -> Vec<Unit> {
    let mut blocks = Vec::new();
    let mut cursor = section.start;

    let tables: Vec<Range<usize>> = protected
        .iter()
        .filter(|p| p.start < section.end && p.end > section.start)
        .map(|p| p.start.max(section.start)..p.end.min(section.end))
        .collect();

    for table in tables {
        if cursor < table.start {
            blocks.extend(paragraphs(text, cursor..table.start));
        }
        blocks.push(Unit {
            range: table.clone(),
            atomic: true,
        });
        cursor = table.end;
    }
    if cursor < section.end {
        blocks.extend(paragraphs(text, cursor..section.end));
    }
    blocks
}

fn paragraphs(text: &str, range: Range<usize>) -> Vec<Unit> {
    let slice = &text[range.clone()];
    let mut out = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(found) = slice[search..].find("\n\n") {
        let at = search + found;
        out.push(range.start + start..range.start + at);
        let mut next = at + 2;
        while slice[next..].starts_with('\n') {
            next += 1;
        }
        start = next;
        search = next;
    }
    out.push(range.start + start..range.end);
    out.into_iter()
        .filter(|r| !text[r.clone()].trim().is_empty())
        .map(|range| Unit {
            range,
            atomic: false,
        })
        .collect()
}

/// Cut after `.`, `!` or `?` followed by whitespace.
fn sentence_ranges(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = slice.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(j, next)) = chars.peek() {
            if next.is_whitespace() {
                out.push(range.start + start..range.start + j);
                start = j;
            }
        }
    }
    if start < slice.len() {
        out.push(range.start + start..range.end);
    }
    out
}

/// Last resort for a sentence over the limit: cut at whitespace, and
/// hard-cut a single word that is longer than the limit.
fn word_ranges(text: &str, range: Range<usize>, max_chars: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = range.start;
    while char_len(text, &(start..range.end)) > max_chars {
        let slice = &text[start..range.end];
        let limit = slice
            .char_indices()
            .nth(max_chars)
            .map(|(b, _)| b)
            .unwrap_or(slice.len());
        let cut = slice[..limit]
            .rfind(char::is_whitespace)
            .filter(|&p| p > 0)
            .unwrap_or(limit);
        out.push(start..start + cut);
        start += cut;
    }
    if start < range.end {
        out.push(start..range.end);
    }
    out
}

/// Greedily merge consecutive units while the merged span fits.
fn pack(text: &str, units: Vec<Unit>, max_chars: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for unit in units {
        if unit.atomic && char_len(text, &unit.range) > max_chars {
            if let Some(c) = current.take() {
                out.push(c);
            }
            out.push(unit.range);
            continue;
        }
        current = match current.take() {
            None => Some(unit.range),
            Some(c) => {
                let merged = c.start..unit.range.end;
                if char_len(text, &merged) <= max_chars {
                    Some(merged)
                } else {
                    out.push(c);
                    Some(unit.range)
                }
            }
        };
    }
    if let Some(c) = current {
        out.push(c);
    }
    out
}

fn trim_range(text: &str, range: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail >= slice.len() {
        return None;
    }
    Some(range.start + lead..range.end - trail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(text: &str, offset: usize) -> Heading {
        Heading {
            text: text.to_string(),
            offset,
            level: 1,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_document("Hello, world!", &[], &[], 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_document("", &[], &[], 700).is_empty());
        assert!(chunk_document("  \n\n ", &[], &[], 700).is_empty());
    }

    #[test]
    fn test_splits_at_headings() {
        let text = "Preamble.\nScope\nWe build things.\nFees\nTen dollars.";
        let scope = text.find("Scope").unwrap();
        let fees = text.find("Fees").unwrap();
        let chunks = chunk_document(
            text,
            &[heading("Scope", scope), heading("Fees", fees)],
            &[],
            700,
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].heading, None);
        assert_eq!(chunks[1].heading.as_deref(), Some("Scope"));
        assert!(chunks[1].text.starts_with("Scope"));
        assert_eq!(chunks[2].heading.as_deref(), Some("Fees"));
        assert_eq!(chunks[2].text, "Fees\nTen dollars.");
    }

    #[test]
    fn test_long_section_packs_paragraphs_under_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is para one.\n\nThis is para two.\n\nThis is para three.";
        let chunks = chunk_document(text, &[], &[], 5);
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(c.text.chars().count() <= 20, "{:?}", c.text);
        }
    }

    #[test]
    fn test_overlong_paragraph_splits_at_sentences() {
        let text = "First sentence here. Second one here. Third is last.";
        let chunks = chunk_document(text, &[], &[], 6); // 24 chars
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["First sentence here.", "Second one here.", "Third is last."]
        );
    }

    #[test]
    fn test_never_splits_detected_table() {
        let table = "| Item | Amount |\n| Design | 500 |\n| Build | 1000 |";
        let text = format!("Intro paragraph.\n\n{}\n\nClosing words.", table);
        let chunks = chunk_document(&text, &[], &[], 3); // 12 chars
        assert!(chunks.iter().any(|c| c.text == table));
    }

    #[test]
    fn test_table_span_from_extraction_suppresses_inner_heading() {
        let text = "Fees\nA 1\nB 2\nC 3\nEnd";
        let table_start = text.find("A 1").unwrap();
        let table_end = text.find("End").unwrap() - 1;
        let inner = text.find("B 2").unwrap();
        let chunks = chunk_document(
            text,
            &[heading("B 2", inner)],
            &[(table_start, table_end)],
            2,
        );
        assert!(chunks.iter().any(|c| c.text == "A 1\nB 2\nC 3"));
        assert!(chunks.iter().all(|c| c.heading.is_none()));
    }

    #[test]
    fn test_spans_are_character_offsets() {
        let text = "Café résumé.\n\nNext part.";
        let chunks = chunk_document(text, &[], &[], 3);
        for c in &chunks {
            let sliced: String = text.chars().skip(c.start).take(c.end - c.start).collect();
            assert_eq!(sliced, c.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon. Zeta eta theta iota kappa.\n\nLambda";
        let headings = [heading("Alpha", 0)];
        let c1 = chunk_document(text, &headings, &[], 4);
        let c2 = chunk_document(text, &headings, &[], 4);
        assert_eq!(c1, c2);
        assert!(c1.len() > 1);
    }
}
