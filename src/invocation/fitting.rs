use tracing::{trace, warn};

use crate::{
    error::{InvocationError, Result},
    types::{Prompt, TokenId},
};

/// Fit a prompt into a context window, leaving room for generation.
///
/// The prompt is returned unchanged when its tokens plus `max_generation_length` fit
/// into `context_window`. Otherwise only the first
/// `context_window - max_generation_length` tokens are kept (none if the reservation
/// alone fills the window) and decoded back into text.
pub fn fit_prompt<T, D>(
    prompt: &Prompt,
    max_generation_length: usize,
    context_window: usize,
    tokenize: T,
    detokenize: D,
) -> Result<String>
where
    T: FnOnce(&str) -> Result<Vec<TokenId>>,
    D: FnOnce(&[TokenId]) -> Result<String>,
{
    let text = prompt.as_text().ok_or_else(|| InvocationError::InvalidInputType {
        expected: "str",
        actual: prompt.kind().to_string(),
    })?;

    let tokens = tokenize(text)?;
    if tokens.len().saturating_add(max_generation_length) <= context_window {
        trace!(prompt_tokens = tokens.len(), context_window, "Prompt fits");
        return Ok(text.to_string());
    }

    let cutoff = context_window.saturating_sub(max_generation_length);
    warn!(
        prompt_tokens = tokens.len(),
        max_generation_length,
        context_window,
        kept_tokens = cutoff,
        "Prompt truncated to fit within max token limit."
    );

    detokenize(&tokens[..cutoff.min(tokens.len())])
}
