// Location: src/model/tokenizer.rs

use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

use crate::{
    error::{InvocationError, Result},
    types::TokenId,
};

const BOS_CANDIDATES: [&str; 2] = ["<s>", "<|begin_of_text|>"];
const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|end_of_text|>", "<|eot_id|>", "<|endoftext|>"];

/// HuggingFace tokenizer with the special tokens generation cares about
pub struct LlamaTokenizer {
    tokenizer: HfTokenizer,
    bos_token_id: Option<TokenId>,
    eos_token_ids: Vec<TokenId>,
}

impl LlamaTokenizer {
    /// Load a `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = HfTokenizer::from_file(path).map_err(|e| {
            InvocationError::model(format!(
                "Failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self::new(tokenizer))
    }

    /// Wrap a tokenizer, picking up the usual BOS and EOS tokens
    pub fn new(tokenizer: HfTokenizer) -> Self {
        let bos_token_id = BOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        let eos_token_ids = EOS_CANDIDATES
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();

        Self {
            tokenizer,
            bos_token_id,
            eos_token_ids,
        }
    }

    /// Add end-of-sequence IDs declared by the model config
    pub fn add_eos_tokens(&mut self, ids: impl IntoIterator<Item = TokenId>) {
        for id in ids {
            if !self.eos_token_ids.contains(&id) {
                self.eos_token_ids.push(id);
            }
        }
    }

    /// Override the BOS token; `None` keeps the current one
    pub fn set_bos_token(&mut self, id: Option<TokenId>) {
        if id.is_some() {
            self.bos_token_id = id;
        }
    }

    /// Encode text, including the special tokens the tokenizer adds on its own
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InvocationError::TokenizationError(format!("Tokenization failed: {}", e)))?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Decode tokens back to text, dropping special tokens
    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| InvocationError::TokenizationError(format!("Decoding failed: {}", e)))
    }

    /// Printable form of a single token
    pub fn token_text(&self, id: TokenId) -> String {
        self.decode(&[id])
            .ok()
            .filter(|text| !text.is_empty())
            .or_else(|| self.tokenizer.id_to_token(id))
            .unwrap_or_default()
    }

    /// Beginning-of-sequence token, if the vocabulary has one
    pub fn bos_token_id(&self) -> Option<TokenId> {
        self.bos_token_id
    }

    /// Whether `id` ends generation
    pub fn is_eos(&self, id: TokenId) -> bool {
        self.eos_token_ids.contains(&id)
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

/// Turns generated tokens into text fragments as they arrive.
///
/// Decoding happens over a sliding window so that tokenizers which strip the leading
/// space of a sequence still produce the right spacing, and nothing is emitted while
/// the window ends inside a multi-byte character.
#[derive(Debug, Default)]
pub struct TokenDecoder {
    tokens: Vec<TokenId>,
    prev_index: usize,
    current_index: usize,
}

impl TokenDecoder {
    /// Decoder with no tokens seen
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token, returning the text it completes, if any
    pub fn push(&mut self, tokenizer: &LlamaTokenizer, token: TokenId) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            tokenizer.decode(&self.tokens[self.prev_index..self.current_index])?
        };

        self.tokens.push(token);
        let text = tokenizer.decode(&self.tokens[self.prev_index..])?;

        let complete = text.len() > prev_text.len()
            && text.is_char_boundary(prev_text.len())
            && !text.ends_with('\u{FFFD}');
        if !complete {
            return Ok(None);
        }

        let fresh = text[prev_text.len()..].to_string();
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        Ok(Some(fresh))
    }

    /// Text of tokens still held back
    pub fn flush(&self, tokenizer: &LlamaTokenizer) -> Result<String> {
        let prev_text = tokenizer.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = tokenizer.decode(&self.tokens[self.prev_index..])?;

        Ok(text
            .get(prev_text.len()..)
            .map(|rest| rest.trim_end_matches('\u{FFFD}').to_string())
            .unwrap_or_default())
    }
}
