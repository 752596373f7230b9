// Location: src/model/runtime.rs

use std::cmp::Ordering;
use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use tracing::{debug, info, warn};

use crate::{
    config::ModelConfig,
    error::{InvocationError, Result},
    invocation::{CompletionStream, TextGenerationEngine},
    types::{Completion, CompletionChoice, FinishReason, GenerationParams, Logprobs, TokenId},
};

use super::{
    loader::{load_weights, ModelFiles},
    select_device, unsupported_options,
    tokenizer::{LlamaTokenizer, TokenDecoder},
    DEFAULT_MAX_TOKENS, DEFAULT_REPEAT_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P,
};

struct LoadedModel {
    model: Llama,
    config: Config,
}

/// Llama-family model running on candle
pub struct CandleLlamaEngine {
    model_id: String,
    model: Option<LoadedModel>,
    tokenizer: LlamaTokenizer,
    device: Device,
    dtype: DType,
    context_size: usize,
    seed: u64,
    repeat_last_n: usize,
    verbose: bool,
}

impl CandleLlamaEngine {
    /// Load tokenizer and weights from the model directory named by the config
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let start = Instant::now();
        let options = &config.engine;

        for option in unsupported_options(options) {
            warn!(option, "Engine option is not supported by the candle backend and is ignored");
        }

        let files = ModelFiles::resolve(Path::new(&config.model_name_or_path))?;
        let raw_config = std::fs::read(&files.config).map_err(|e| {
            InvocationError::model_with_source(
                format!("Failed to read {}", files.config.display()),
                e,
            )
        })?;
        let llama_config: LlamaConfig = serde_json::from_slice(&raw_config).map_err(|e| {
            InvocationError::model_with_source(
                format!("Failed to parse {}", files.config.display()),
                e,
            )
        })?;
        let llama_config = llama_config.into_config(false);

        let tokenizer = LlamaTokenizer::from_file(&files.tokenizer)?;
        let device = select_device();
        let dtype = if options.f16_kv { DType::F16 } else { DType::F32 };

        let model = if options.vocab_only {
            info!("Loaded vocabulary only; generation is disabled");
            None
        } else {
            let vb = load_weights(&files.weights, dtype, &device, options.use_mmap)?;
            let model = Llama::load(vb, &llama_config)?;
            Some(model)
        };

        let engine = Self::from_parts(
            config,
            tokenizer,
            model.map(|model| (model, llama_config.clone())),
            device,
            dtype,
            llama_config.max_position_embeddings,
        );

        if engine.verbose {
            info!(
                model = %engine.model_id,
                context_size = engine.context_size,
                ?dtype,
                elapsed = ?start.elapsed(),
                "Model loaded"
            );
        } else {
            debug!(model = %engine.model_id, elapsed = ?start.elapsed(), "Model loaded");
        }

        Ok(engine)
    }

    /// Assemble an engine from loaded pieces.
    ///
    /// The context window is `config.max_context`, capped at what the model's
    /// positional embeddings cover.
    pub(crate) fn from_parts(
        config: &ModelConfig,
        mut tokenizer: LlamaTokenizer,
        model: Option<(Llama, Config)>,
        device: Device,
        dtype: DType,
        max_position_embeddings: usize,
    ) -> Self {
        let context_size = if config.max_context > max_position_embeddings {
            warn!(
                requested = config.max_context,
                supported = max_position_embeddings,
                "max_context exceeds the model's positional range; clamping"
            );
            max_position_embeddings
        } else {
            config.max_context
        };

        if let Some((_, llama_config)) = &model {
            match &llama_config.eos_token_id {
                Some(LlamaEosToks::Single(id)) => tokenizer.add_eos_tokens([*id]),
                Some(LlamaEosToks::Multiple(ids)) => tokenizer.add_eos_tokens(ids.iter().copied()),
                None => {}
            }
            tokenizer.set_bos_token(llama_config.bos_token_id);
        }

        Self {
            model_id: config.model_name_or_path.clone(),
            model: model.map(|(model, config)| LoadedModel { model, config }),
            tokenizer,
            device,
            dtype,
            context_size,
            seed: config.engine.seed,
            repeat_last_n: config.engine.last_n_tokens_size,
            verbose: config.engine.verbose,
        }
    }

    /// Identifier reported in completions
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn generator<'a>(&'a self, prompt: &str, params: &GenerationParams) -> Result<Generator<'a>> {
        let model = self.model.as_ref().ok_or_else(|| {
            InvocationError::model("Model was loaded with vocab_only; generation is unavailable")
        })?;

        let mut tokens = self.tokenizer.encode(prompt)?;
        if tokens.is_empty() {
            let bos = self.tokenizer.bos_token_id().ok_or_else(|| {
                InvocationError::model("Prompt produced no tokens and the model has no BOS token")
            })?;
            tokens.push(bos);
        }

        let cache = Cache::new(true, self.dtype, &model.config, &self.device)?;
        let sampler = LogitsProcessor::from_sampling(self.seed, sampling(params));

        Ok(Generator {
            engine: self,
            model,
            cache,
            sampler,
            prompt_len: tokens.len(),
            tokens,
            index_pos: 0,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            repeat_penalty: params.repeat_penalty.unwrap_or(DEFAULT_REPEAT_PENALTY),
            top_logprobs: params.logprobs,
            decoder: TokenDecoder::new(),
            stops: StopMatcher::new(&params.stop),
            echo: params.echo.unwrap_or(false).then(|| prompt.to_string()),
            suffix: params.suffix.clone(),
            pending_logprobs: None,
            started: Instant::now(),
            done: false,
        })
    }
}

impl TextGenerationEngine for CandleLlamaEngine {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        self.tokenizer.decode(tokens)
    }

    fn complete(&mut self, prompt: &str, params: &GenerationParams) -> Result<Completion> {
        let mut text = String::new();
        let mut logprobs: Option<Logprobs> = None;
        let mut finish_reason = None;

        for step in self.generator(prompt, params)? {
            for choice in step?.choices {
                text.push_str(&choice.text);
                if let Some(step_logprobs) = choice.logprobs {
                    logprobs.get_or_insert_with(Logprobs::default).extend(step_logprobs);
                }
                finish_reason = choice.finish_reason.or(finish_reason);
            }
        }

        Ok(Completion {
            model: self.model_id.clone(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                logprobs,
                finish_reason,
            }],
        })
    }

    fn complete_stream<'a>(
        &'a mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<CompletionStream<'a>> {
        Ok(Box::new(self.generator(prompt, params)?))
    }
}

/// Map generation parameters onto a candle sampling strategy
fn sampling(params: &GenerationParams) -> Sampling {
    let temperature = params.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }

    let top_p = params.top_p.unwrap_or(DEFAULT_TOP_P);
    let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K);
    match (top_k, top_p < 1.0) {
        (0, false) => Sampling::All { temperature },
        (0, true) => Sampling::TopP { p: top_p, temperature },
        (k, false) => Sampling::TopK { k, temperature },
        (k, true) => Sampling::TopKThenTopP { k, p: top_p, temperature },
    }
}

/// One generation run; each item is a step of the completion
struct Generator<'a> {
    engine: &'a CandleLlamaEngine,
    model: &'a LoadedModel,
    cache: Cache,
    sampler: LogitsProcessor,
    tokens: Vec<TokenId>,
    prompt_len: usize,
    index_pos: usize,
    max_tokens: usize,
    repeat_penalty: f32,
    top_logprobs: Option<usize>,
    decoder: TokenDecoder,
    stops: StopMatcher,
    echo: Option<String>,
    suffix: Option<String>,
    pending_logprobs: Option<Logprobs>,
    started: Instant,
    done: bool,
}

impl Generator<'_> {
    fn generated(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }

    fn chunk(&mut self, text: String, finish_reason: Option<FinishReason>) -> Completion {
        Completion {
            model: self.engine.model_id.clone(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                logprobs: self.pending_logprobs.take(),
                finish_reason,
            }],
        }
    }

    fn advance(&mut self) -> Result<Completion> {
        loop {
            if self.generated() >= self.max_tokens || self.tokens.len() >= self.engine.context_size {
                return self.finish(String::new(), FinishReason::Length, false);
            }

            let token = self.sample_next()?;
            if self.engine.tokenizer.is_eos(token) {
                return self.finish(String::new(), FinishReason::Stop, false);
            }
            self.tokens.push(token);

            if let Some(fragment) = self.decoder.push(&self.engine.tokenizer, token)? {
                let (text, stopped) = self.stops.feed(&fragment);
                if stopped {
                    return self.finish(text, FinishReason::Stop, true);
                }
                if !text.is_empty() {
                    return Ok(self.chunk(text, None));
                }
            }
        }
    }

    /// Final step: held back text, then the suffix
    fn finish(&mut self, mut text: String, reason: FinishReason, hit_stop: bool) -> Result<Completion> {
        self.done = true;

        if !hit_stop {
            let tail = self.decoder.flush(&self.engine.tokenizer)?;
            let (emitted, stopped) = self.stops.feed(&tail);
            text.push_str(&emitted);
            if !stopped {
                text.push_str(&self.stops.flush());
            }
        }
        if let Some(suffix) = self.suffix.take() {
            text.push_str(&suffix);
        }

        let generated = self.generated();
        if self.engine.verbose {
            info!(generated, ?reason, elapsed = ?self.started.elapsed(), "Generation finished");
        } else {
            debug!(generated, ?reason, "Generation finished");
        }

        Ok(self.chunk(text, Some(reason)))
    }

    fn sample_next(&mut self) -> Result<TokenId> {
        let context = if self.index_pos == 0 {
            &self.tokens[..]
        } else {
            &self.tokens[self.tokens.len() - 1..]
        };
        let context_len = context.len();

        let input = Tensor::new(context, &self.engine.device)?.unsqueeze(0)?;
        let logits = self.model.model.forward(&input, self.index_pos, &mut self.cache)?;
        self.index_pos += context_len;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;

        let logits = if (self.repeat_penalty - 1.0).abs() < f32::EPSILON {
            logits
        } else {
            let start_at = self.tokens.len().saturating_sub(self.engine.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &self.tokens[start_at..],
            )?
        };

        let token = self.sampler.sample(&logits)?;
        if let Some(n) = self.top_logprobs {
            let step = self.token_logprobs(&logits, token, n)?;
            self.pending_logprobs
                .get_or_insert_with(Logprobs::default)
                .extend(step);
        }

        Ok(token)
    }

    fn token_logprobs(&self, logits: &Tensor, token: TokenId, n: usize) -> Result<Logprobs> {
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?.to_vec1::<f32>()?;
        let chosen = log_probs
            .get(token as usize)
            .copied()
            .unwrap_or(f32::NEG_INFINITY);

        let mut ranked: Vec<(usize, f32)> = log_probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let tokenizer = &self.engine.tokenizer;
        let top = ranked
            .into_iter()
            .take(n)
            .map(|(id, logprob)| (tokenizer.token_text(id as TokenId), logprob))
            .collect();

        Ok(Logprobs {
            tokens: vec![tokenizer.token_text(token)],
            token_logprobs: vec![chosen],
            top_logprobs: vec![top],
        })
    }
}

impl Iterator for Generator<'_> {
    type Item = Result<Completion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(prompt) = self.echo.take() {
            return Some(Ok(self.chunk(prompt, None)));
        }

        let step = self.advance();
        if step.is_err() {
            self.done = true;
        }
        Some(step)
    }
}

/// Withholds text that could be the start of a stop sequence
#[derive(Debug, Default)]
pub(crate) struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

impl StopMatcher {
    pub(crate) fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            held: String::new(),
        }
    }

    /// Add generated text. Returns the text safe to emit and whether a stop
    /// sequence was hit; text from the stop sequence on is discarded.
    pub(crate) fn feed(&mut self, text: &str) -> (String, bool) {
        self.held.push_str(text);

        if let Some(pos) = self.stops.iter().filter_map(|s| self.held.find(s.as_str())).min() {
            let emit = self.held[..pos].to_string();
            self.held.clear();
            return (emit, true);
        }

        let keep = self
            .stops
            .iter()
            .map(|stop| partial_overlap(&self.held, stop))
            .max()
            .unwrap_or(0);
        let emit: String = self.held.drain(..self.held.len() - keep).collect();
        (emit, false)
    }

    pub(crate) fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

/// Length of the longest proper prefix of `stop` that `text` ends with
fn partial_overlap(text: &str, stop: &str) -> usize {
    (1..stop.len())
        .rev()
        .filter(|&n| stop.is_char_boundary(n))
        .find(|&n| text.ends_with(&stop[..n]))
        .unwrap_or(0)
}
