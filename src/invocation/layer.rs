use tracing::{debug, info};

use crate::{
    config::ModelConfig,
    error::{InvocationError, Result},
    model::CandleLlamaEngine,
    types::{GenerationRequest, Prompt},
};

use super::{fit_prompt, InvocationLayer, TextGenerationEngine};

/// Invocation layer over a locally loaded model.
///
/// Every prompt is fitted into the engine's context window, keeping
/// `config.max_length` tokens free for the completion, before generation starts.
pub struct LocalModelInvocationLayer<E: TextGenerationEngine = CandleLlamaEngine> {
    config: ModelConfig,
    engine: E,
}

impl LocalModelInvocationLayer<CandleLlamaEngine> {
    /// Validate the config and load the model it points at
    pub fn load(config: ModelConfig) -> Result<Self> {
        config.validate()?;

        info!(model = %config.model_name_or_path, "Loading model for invocation layer");
        let engine = CandleLlamaEngine::load(&config)?;

        Ok(Self { config, engine })
    }
}

impl<E: TextGenerationEngine> LocalModelInvocationLayer<E> {
    /// Wrap an already constructed engine
    pub fn with_engine(config: ModelConfig, engine: E) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, engine })
    }

    /// Configuration captured at construction
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The wrapped engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Fit a prompt into the engine's context window
    pub fn ensure_token_limit(&self, prompt: &Prompt) -> Result<String> {
        fit_prompt(
            prompt,
            self.config.max_length,
            self.engine.context_size(),
            |text| self.engine.tokenize(text),
            |tokens| self.engine.detokenize(tokens),
        )
    }

    /// Like [`InvocationLayer::invoke`], handing each streamed fragment to
    /// `on_fragment` as soon as the engine produces it.
    pub fn invoke_with_handler<F>(
        &mut self,
        request: GenerationRequest,
        mut on_fragment: F,
    ) -> Result<Vec<String>>
    where
        F: FnMut(&str),
    {
        let prompt = self.ensure_token_limit(&request.prompt)?;

        let mut params = request.params;
        if params.max_tokens.is_none() {
            params.max_tokens = Some(self.config.max_length);
        }

        let mut generated_texts = Vec::new();
        if request.stream {
            for step in self.engine.complete_stream(&prompt, &params)? {
                let step = step?;
                let fragment = step
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.text)
                    .ok_or_else(|| InvocationError::model("stream step carried no choices"))?;

                on_fragment(&fragment);
                generated_texts.push(fragment);
            }
        } else {
            let output = self.engine.complete(&prompt, &params)?;
            generated_texts = output.choices.into_iter().map(|choice| choice.text).collect();
        }

        debug!(
            stream = request.stream,
            fragments = generated_texts.len(),
            "Invocation finished"
        );

        Ok(generated_texts)
    }
}

impl<E: TextGenerationEngine> InvocationLayer for LocalModelInvocationLayer<E> {
    fn invoke(&mut self, request: GenerationRequest) -> Result<Vec<String>> {
        self.invoke_with_handler(request, |_| {})
    }

    fn supports(model_name_or_path: &str) -> bool {
        !model_name_or_path.is_empty()
    }
}
