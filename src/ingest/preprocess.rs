use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};
use tracing::{debug, info};

use super::{Document, IngestError, IngestResult, PAGE_BREAK};

/// Unit documents are split by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitBy {
    /// Whitespace separated words
    Word,
    /// Sentences ending in `.`, `!` or `?`
    Sentence,
    /// Blocks separated by a blank line
    Passage,
}

impl FromStr for SplitBy {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "word" => Ok(Self::Word),
            "sentence" => Ok(Self::Sentence),
            "passage" => Ok(Self::Passage),
            other => Err(IngestError::Validation(format!(
                "unknown split_by '{other}'. Expected 'word', 'sentence', or 'passage'."
            ))),
        }
    }
}

/// Cleaning and splitting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreProcessorConfig {
    /// Collapse runs of blank lines into one
    pub clean_empty_lines: bool,
    /// Strip leading and trailing whitespace from every line
    pub clean_whitespace: bool,
    /// Drop first and last lines that repeat across the pages of a document
    pub clean_header_footer: bool,
    /// Unit `split_length` and `split_overlap` count in
    pub split_by: SplitBy,
    /// Units per split
    pub split_length: usize,
    /// Units shared between consecutive splits
    pub split_overlap: usize,
    /// Keep word splits on sentence boundaries where possible
    pub split_respect_sentence_boundary: bool,
}

impl Default for PreProcessorConfig {
    fn default() -> Self {
        Self {
            clean_empty_lines: true,
            clean_whitespace: true,
            clean_header_footer: false,
            split_by: SplitBy::Word,
            split_length: 200,
            split_overlap: 0,
            split_respect_sentence_boundary: true,
        }
    }
}

impl PreProcessorConfig {
    /// Split length must be positive and larger than the overlap
    pub fn validate(&self) -> IngestResult<()> {
        if self.split_length == 0 {
            return Err(IngestError::Validation(
                "split_length must be greater than zero".into(),
            ));
        }
        if self.split_overlap >= self.split_length {
            return Err(IngestError::Validation(format!(
                "split_overlap ({}) must be smaller than split_length ({})",
                self.split_overlap, self.split_length
            )));
        }
        Ok(())
    }
}

/// Cleans documents and splits them into retrieval-sized pieces
pub struct PreProcessor {
    config: PreProcessorConfig,
}

impl PreProcessor {
    /// Validate `config` and build the preprocessor
    pub fn new(config: PreProcessorConfig) -> IngestResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Settings in use
    pub fn config(&self) -> &PreProcessorConfig {
        &self.config
    }

    /// Clean and split documents whose pages are separated by [`PAGE_BREAK`].
    ///
    /// Header/footer removal compares the pages of one document. Splits may span
    /// pages; each records the page it starts on as `page` and its position as
    /// `_split_id`.
    pub fn process(&self, documents: Vec<Document>) -> IngestResult<Vec<Document>> {
        let input = documents.len();
        let separator = PAGE_BREAK.to_string();

        let mut output = Vec::new();
        for doc in documents {
            let mut pages: Vec<String> = doc.content.split(PAGE_BREAK).map(str::to_owned).collect();
            if self.config.clean_header_footer {
                strip_repeated_edges(&mut pages);
            }
            let text = pages
                .iter()
                .map(|page| self.clean(page))
                .collect::<Vec<_>>()
                .join(&separator);

            let splits = self
                .split(&text)?
                .into_iter()
                .filter(|(_, split)| !split.trim().is_empty());
            for (split_id, (offset, split)) in splits.enumerate() {
                let page = text[..offset].matches(PAGE_BREAK).count() + 1;
                let mut meta = doc.meta.clone();
                meta.insert("_split_id".to_string(), Value::from(split_id));
                meta.insert("page".to_string(), Value::from(page));
                output.push(Document::new(split, meta));
            }
        }

        info!(input, output = output.len(), "Preprocessed documents");
        Ok(output)
    }

    fn clean(&self, text: &str) -> String {
        let mut text = if self.config.clean_whitespace {
            text.lines().map(str::trim).collect::<Vec<_>>().join("\n")
        } else {
            text.to_string()
        };

        if self.config.clean_empty_lines {
            let mut collapsed = String::with_capacity(text.len());
            let mut newlines = 0;
            for c in text.chars() {
                if c == '\n' {
                    newlines += 1;
                    if newlines > 2 {
                        continue;
                    }
                } else {
                    newlines = 0;
                }
                collapsed.push(c);
            }
            text = collapsed;
        }

        text
    }

    /// Splits paired with their byte offset in `text`
    fn split(&self, text: &str) -> IngestResult<Vec<(usize, String)>> {
        let length = self.config.split_length;
        let overlap = self.config.split_overlap;

        let splits = match self.config.split_by {
            SplitBy::Word if self.config.split_respect_sentence_boundary => {
                let chunk_config = ChunkConfig::new(length)
                    .with_overlap(overlap)
                    .map_err(|e| IngestError::Validation(format!("invalid split overlap: {e}")))?
                    .with_sizer(WordCount);
                TextSplitter::new(chunk_config)
                    .chunk_indices(text)
                    .map(|(offset, chunk)| (offset, chunk.to_owned()))
                    .collect()
            }
            SplitBy::Word => {
                let words: Vec<&str> = text.split_whitespace().collect();
                windows(text, &words, length, overlap, " ")
            }
            SplitBy::Sentence => windows(text, &sentences(text), length, overlap, " "),
            SplitBy::Passage => {
                let passages: Vec<&str> = text
                    .split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect();
                windows(text, &passages, length, overlap, "\n\n")
            }
        };

        debug!(split_by = ?self.config.split_by, splits = splits.len(), "Split document");
        Ok(splits)
    }
}

/// Sizes chunks by whitespace separated words
struct WordCount;

impl ChunkSizer for WordCount {
    fn size(&self, chunk: &str) -> usize {
        chunk.split_whitespace().count()
    }
}

/// Join `length` units at a time, stepping by `length - overlap`.
///
/// Units are slices of `text`; each split carries the offset of its first unit.
fn windows(
    text: &str,
    units: &[&str],
    length: usize,
    overlap: usize,
    separator: &str,
) -> Vec<(usize, String)> {
    let step = length - overlap;
    let mut splits = Vec::new();
    let mut start = 0;
    while start < units.len() {
        let end = (start + length).min(units.len());
        let offset = units[start].as_ptr() as usize - text.as_ptr() as usize;
        splits.push((offset, units[start..end].join(separator)));
        if end == units.len() {
            break;
        }
        start += step;
    }
    splits
}

/// Sentences end at `.`, `!` or `?` followed by whitespace or the end of the text
fn sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn edge_key(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .trim()
        .to_string()
}

fn first_line(page: &str) -> Option<&str> {
    page.lines().find(|line| !line.trim().is_empty())
}

fn last_line(page: &str) -> Option<&str> {
    page.lines().rev().find(|line| !line.trim().is_empty())
}

/// The edge line shared by at least `threshold` pages, digits ignored
fn repeated<'a>(lines: impl Iterator<Item = Option<&'a str>>, threshold: usize) -> Option<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in lines.flatten() {
        let key = edge_key(line);
        if !key.is_empty() {
            *counts.entry(key).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .max_by_key(|(_, count)| *count)
        .map(|(key, _)| key)
}

/// Remove headers and footers repeated on at least half of the pages of one document
fn strip_repeated_edges(pages: &mut [String]) {
    if pages.len() < 2 {
        return;
    }
    let threshold = pages.len().div_ceil(2).max(2);
    let header = repeated(pages.iter().map(|p| first_line(p)), threshold);
    let footer = repeated(pages.iter().map(|p| last_line(p)), threshold);
    if header.is_none() && footer.is_none() {
        return;
    }

    for page in pages.iter_mut() {
        let mut lines: Vec<&str> = page.lines().collect();

        if let Some(header) = &header {
            if let Some(i) = lines.iter().position(|line| !line.trim().is_empty()) {
                if edge_key(lines[i]) == *header {
                    lines.remove(i);
                }
            }
        }
        if let Some(footer) = &footer {
            if let Some(i) = lines.iter().rposition(|line| !line.trim().is_empty()) {
                if edge_key(lines[i]) == *footer {
                    lines.remove(i);
                }
            }
        }

        let cleaned = lines.join("\n");
        *page = cleaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::meta;
    use pretty_assertions::assert_eq;

    fn preprocessor(config: PreProcessorConfig) -> PreProcessor {
        PreProcessor::new(config).unwrap()
    }

    fn split_texts(pre: &PreProcessor, text: &str) -> Vec<String> {
        pre.split(text).unwrap().into_iter().map(|(_, split)| split).collect()
    }

    #[test]
    fn test_config_validation() {
        let config = PreProcessorConfig {
            split_length: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(IngestError::Validation(_))));

        let config = PreProcessorConfig {
            split_length: 10,
            split_overlap: 10,
            ..Default::default()
        };
        assert!(PreProcessor::new(config).is_err());
        assert!(PreProcessorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_split_by_from_str() {
        assert_eq!("Sentence".parse::<SplitBy>().unwrap(), SplitBy::Sentence);
        assert!("paragraph".parse::<SplitBy>().is_err());
    }

    #[test]
    fn test_cleaning() {
        let pre = preprocessor(PreProcessorConfig::default());
        assert_eq!(pre.clean("  Item 1  \n\n\n\n  Item 2"), "Item 1\n\nItem 2");

        let pre = preprocessor(PreProcessorConfig {
            clean_whitespace: false,
            clean_empty_lines: false,
            ..Default::default()
        });
        assert_eq!(pre.clean(" a \n\n\n b"), " a \n\n\n b");
    }

    #[test]
    fn test_word_windows_with_overlap() {
        let pre = preprocessor(PreProcessorConfig {
            split_length: 3,
            split_overlap: 1,
            split_respect_sentence_boundary: false,
            ..Default::default()
        });
        let splits = split_texts(&pre, "one two three four five six");
        assert_eq!(splits, vec!["one two three", "three four five", "five six"]);
    }

    #[test]
    fn test_word_splits_respect_sentences() {
        let pre = preprocessor(PreProcessorConfig {
            split_length: 6,
            ..Default::default()
        });
        let text = "The board met twice. Pay rose sharply. Votes were counted.";
        let splits = split_texts(&pre, text);

        assert!(splits.len() >= 2);
        assert!(splits.iter().all(|s| s.split_whitespace().count() <= 6));
        assert_eq!(splits[0], "The board met twice.");
        assert_eq!(splits.join(" "), text);
    }

    #[test]
    fn test_sentence_and_passage_splits() {
        let pre = preprocessor(PreProcessorConfig {
            split_by: SplitBy::Sentence,
            split_length: 2,
            ..Default::default()
        });
        let splits = split_texts(&pre, "Dividends grew 5.5% last year. Buybacks slowed! Why? Rates.");
        assert_eq!(
            splits,
            vec!["Dividends grew 5.5% last year. Buybacks slowed!", "Why? Rates."]
        );

        let pre = preprocessor(PreProcessorConfig {
            split_by: SplitBy::Passage,
            split_length: 1,
            ..Default::default()
        });
        let splits = split_texts(&pre, "First passage.\n\nSecond passage.\n\n\n");
        assert_eq!(splits, vec!["First passage.", "Second passage."]);
    }

    #[test]
    fn test_process_adds_split_ids_and_drops_empty() {
        let pre = preprocessor(PreProcessorConfig {
            split_length: 2,
            split_respect_sentence_boundary: false,
            ..Default::default()
        });
        let docs = vec![
            Document::new("alpha beta gamma", meta("a.pdf", 1)),
            Document::new("   \n  ", meta("a.pdf", 2)),
        ];

        let out = pre.process(docs).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "alpha beta");
        assert_eq!(out[1].content, "gamma");
        assert_eq!(out[1].meta["_split_id"], 1);
        assert_eq!(out[1].meta["page"], 1);
        assert_ne!(out[0].id, out[1].id);
    }

    #[test]
    fn test_header_footer_removed_per_document() {
        let pre = preprocessor(PreProcessorConfig {
            clean_header_footer: true,
            split_length: 100,
            ..Default::default()
        });
        let proxy = [
            "ACME Proxy 2024\nBoard overview.\nPage 1",
            "ACME Proxy 2024\nPay overview.\nPage 2",
            "ACME Proxy 2024\nVoting items.\nPage 3",
        ]
        .join("\u{c}");
        let docs = vec![
            Document::new(proxy, meta("p.pdf", 1)),
            Document::new("ACME Proxy 2024\nUnrelated file.\nPage 9", meta("q.pdf", 1)),
        ];

        let out = pre.process(docs).unwrap();
        let contents: Vec<&str> = out.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "Board overview.\u{c}Pay overview.\u{c}Voting items.",
                "ACME Proxy 2024\nUnrelated file.\nPage 9",
            ]
        );
    }

    #[test]
    fn test_splits_span_pages_and_record_start_page() {
        let pre = preprocessor(PreProcessorConfig {
            split_length: 3,
            split_respect_sentence_boundary: false,
            ..Default::default()
        });
        let doc = Document::new("alpha beta\u{c}gamma delta epsilon\u{c}zeta", meta("a.pdf", 7));

        let out = pre.process(vec![doc]).unwrap();
        let summary: Vec<(&str, u64)> = out
            .iter()
            .map(|d| (d.content.as_str(), d.meta["page"].as_u64().unwrap()))
            .collect();
        assert_eq!(
            summary,
            vec![("alpha beta gamma", 1), ("delta epsilon zeta", 2)]
        );
        assert_eq!(out[1].meta["_split_id"], 1);
    }

    #[test]
    fn test_short_document_is_one_split_across_pages() {
        let pre = preprocessor(PreProcessorConfig {
            clean_whitespace: false,
            clean_header_footer: true,
            split_length: 500,
            ..Default::default()
        });
        let doc = Document::new(
            "Board nominees are listed.\n\u{c}Advisory vote on pay.\n",
            meta("proxy.pdf", 1),
        );

        let out = pre.process(vec![doc]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].content.starts_with("Board nominees are listed."));
        assert!(out[0].content.ends_with("Advisory vote on pay."));
        assert_eq!(out[0].meta["page"], 1);
    }

    #[test]
    fn test_header_needs_half_of_pages() {
        let mut pages = vec![
            "Confidential\nalpha".to_string(),
            "beta".to_string(),
            "gamma".to_string(),
            "delta".to_string(),
            "epsilon".to_string(),
        ];
        strip_repeated_edges(&mut pages);
        assert_eq!(pages[0], "Confidential\nalpha");
    }
}
