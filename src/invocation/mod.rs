//! Invocation layer: runs a local text generation engine behind a uniform call contract

mod fitting;
mod layer;

pub use fitting::fit_prompt;
pub use layer::LocalModelInvocationLayer;

use crate::{
    error::Result,
    types::{Completion, GenerationParams, GenerationRequest, TokenId},
};

/// Steps of a streamed completion, in the order the engine produces them
pub type CompletionStream<'a> = Box<dyn Iterator<Item = Result<Completion>> + 'a>;

/// Uniform contract every model backend is invoked through
pub trait InvocationLayer {
    /// Generate text for a request, returning the fragments in order
    fn invoke(&mut self, request: GenerationRequest) -> Result<Vec<String>>;

    /// Whether a model identifier can be handled by this layer.
    ///
    /// This is a syntactic check; nothing is loaded or resolved.
    fn supports(model_name_or_path: &str) -> bool
    where
        Self: Sized;
}

/// The generation engine an invocation layer wraps
pub trait TextGenerationEngine {
    /// Total token budget of one generation call
    fn context_size(&self) -> usize;

    /// Encode text with the model's vocabulary
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Decode tokens produced by [`TextGenerationEngine::tokenize`]
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String>;

    /// Run generation to completion
    fn complete(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion>;

    /// Run generation, yielding one partial completion per step
    fn complete_stream<'a>(
        &'a mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<CompletionStream<'a>>;
}
