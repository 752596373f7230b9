//! Common type definitions shared by the invocation layer and its engines

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{InvocationError, Result};

/// A token ID in a model's vocabulary
pub type TokenId = u32;

/// One message of a multi-turn prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker, e.g. `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

/// A prompt as handed to the invocation layer.
///
/// Only plain text can be fitted and generated from. The chat form exists so that
/// callers holding structured prompts get a typed rejection instead of a silent
/// conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// Plain text
    Text(String),
    /// Structured multi-turn messages
    Chat(Vec<ChatMessage>),
}

impl Prompt {
    /// Name of the representation, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Prompt::Text(_) => "str",
            Prompt::Chat(_) => "chat messages",
        }
    }

    /// The text of a plain prompt
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Prompt::Text(text) => Some(text),
            Prompt::Chat(_) => None,
        }
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl TryFrom<Value> for Prompt {
    type Error = InvocationError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Prompt::Text(text)),
            Value::Array(items) => serde_json::from_value::<Vec<ChatMessage>>(Value::Array(items))
                .map(Prompt::Chat)
                .map_err(|_| InvocationError::InvalidInputType {
                    expected: "str",
                    actual: "array".to_string(),
                }),
            other => Err(InvocationError::InvalidInputType {
                expected: "str",
                actual: json_kind(&other).to_string(),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recognized generation parameters. Unset fields fall back to the engine's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Text appended after the completion
    pub suffix: Option<String>,
    /// Maximum number of tokens to generate
    pub max_tokens: Option<usize>,
    /// Sampling temperature; zero or below samples greedily
    pub temperature: Option<f64>,
    /// Nucleus sampling mass
    pub top_p: Option<f64>,
    /// Number of alternative log-probabilities to report per token
    pub logprobs: Option<usize>,
    /// Prepend the prompt to the output
    pub echo: Option<bool>,
    /// Penalty applied to recently generated tokens
    pub repeat_penalty: Option<f32>,
    /// Sample only among the k most likely tokens; 0 disables the cut
    pub top_k: Option<usize>,
    /// Generation stops before any of these sequences
    pub stop: Vec<String>,
}

/// A single call into the invocation layer
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Text to continue
    pub prompt: Prompt,
    /// Sampling and output settings
    pub params: GenerationParams,
    /// Deliver fragments as they are produced
    pub stream: bool,
}

impl GenerationRequest {
    /// Batch request with default parameters
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::default(),
            stream: false,
        }
    }

    /// Replace the generation parameters
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Ask for streamed delivery
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Build a request from a loosely typed option map.
    ///
    /// `prompt` is required. `stream` and the recognized generation parameters are
    /// picked out; every other key is dropped with a warning.
    pub fn from_options(mut options: Map<String, Value>) -> Result<Self> {
        let prompt = options
            .remove("prompt")
            .ok_or(InvocationError::MissingPromptError)
            .and_then(Prompt::try_from)?;

        let stream = match options.remove("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(stream)) => stream,
            Some(other) => return Err(invalid_parameter("stream", "a boolean", &other)),
        };

        let params = GenerationParams {
            suffix: take_string(&mut options, "suffix")?,
            max_tokens: take_usize(&mut options, "max_tokens")?,
            temperature: take_f64(&mut options, "temperature")?,
            top_p: take_f64(&mut options, "top_p")?,
            logprobs: take_usize(&mut options, "logprobs")?,
            echo: take_bool(&mut options, "echo")?,
            repeat_penalty: take_f64(&mut options, "repeat_penalty")?.map(|p| p as f32),
            top_k: take_usize(&mut options, "top_k")?,
            stop: take_stop(&mut options)?,
        };

        if !options.is_empty() {
            let dropped: Vec<&str> = options.keys().map(String::as_str).collect();
            warn!(
                dropped = ?dropped,
                "Ignoring unrecognized generation parameters"
            );
        }

        Ok(Self {
            prompt,
            params,
            stream,
        })
    }
}

fn invalid_parameter(name: &str, expected: &str, value: &Value) -> InvocationError {
    InvocationError::InvalidParameter {
        name: name.to_string(),
        message: format!("expected {} but got {}", expected, json_kind(value)),
    }
}

fn take_string(options: &mut Map<String, Value>, name: &str) -> Result<Option<String>> {
    match options.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(invalid_parameter(name, "a string", &other)),
    }
}

fn take_usize(options: &mut Map<String, Value>, name: &str) -> Result<Option<usize>> {
    match options.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid_parameter(name, "a non-negative integer", &value)),
    }
}

fn take_f64(options: &mut Map<String, Value>, name: &str) -> Result<Option<f64>> {
    match options.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid_parameter(name, "a number", &value)),
    }
}

fn take_bool(options: &mut Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match options.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(value)),
        Some(other) => Err(invalid_parameter(name, "a boolean", &other)),
    }
}

fn take_stop(options: &mut Map<String, Value>) -> Result<Vec<String>> {
    match options.remove("stop") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(stop)) => Ok(vec![stop]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(stop) => Ok(stop),
                other => Err(invalid_parameter("stop", "a list of strings", &other)),
            })
            .collect(),
        Some(other) => Err(invalid_parameter("stop", "a string or a list of strings", &other)),
    }
}

/// Why a choice stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// End of sequence token or stop sequence
    Stop,
    /// Token budget or context window exhausted
    Length,
}

/// Per-token log-probabilities of a choice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logprobs {
    /// Text of each generated token
    pub tokens: Vec<String>,
    /// Log-probability of each generated token
    pub token_logprobs: Vec<f32>,
    /// Most likely alternatives at each step
    pub top_logprobs: Vec<Vec<(String, f32)>>,
}

impl Logprobs {
    /// Append the entries of a later step
    pub fn extend(&mut self, other: Logprobs) {
        self.tokens.extend(other.tokens);
        self.token_logprobs.extend(other.token_logprobs);
        self.top_logprobs.extend(other.top_logprobs);
    }
}

/// One generated alternative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Generated text
    pub text: String,
    /// Position among the choices of a completion
    pub index: usize,
    /// Present when log-probabilities were requested
    pub logprobs: Option<Logprobs>,
    /// Set on the last step only
    pub finish_reason: Option<FinishReason>,
}

/// Result of one engine call, or one step of a streamed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Identifier of the model that produced it
    pub model: String,
    /// Generated alternatives in index order
    pub choices: Vec<CompletionChoice>,
}

impl Completion {
    /// A completion holding a single choice
    pub fn single(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            choices: vec![CompletionChoice {
                text: text.into(),
                index: 0,
                logprobs: None,
                finish_reason: None,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::utils::capture_logs;
    use serde_json::json;

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test options must be an object"),
        }
    }

    #[test]
    fn test_prompt_from_json() {
        assert_eq!(
            Prompt::try_from(json!("hello")).unwrap(),
            Prompt::Text("hello".to_string())
        );

        let chat = Prompt::try_from(json!([{"role": "user", "content": "hi"}])).unwrap();
        assert_eq!(chat.kind(), "chat messages");
        assert!(chat.as_text().is_none());
    }

    #[test]
    fn test_non_string_prompt_rejected() {
        let err = Prompt::try_from(json!(42)).unwrap_err();
        assert!(matches!(
            err,
            InvocationError::InvalidInputType { expected: "str", ref actual } if actual == "number"
        ));

        let err = Prompt::try_from(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, InvocationError::InvalidInputType { .. }));
    }

    #[test]
    fn test_request_from_options() {
        let request = GenerationRequest::from_options(options(json!({
            "prompt": "Who signed the proxy statement?",
            "stream": true,
            "max_tokens": 64,
            "temperature": 0.2,
            "top_k": 10,
            "stop": ["\n\n", "Question:"],
            "echo": false,
        })))
        .unwrap();

        assert!(request.stream);
        assert_eq!(request.prompt, Prompt::from("Who signed the proxy statement?"));
        assert_eq!(request.params.max_tokens, Some(64));
        assert_eq!(request.params.temperature, Some(0.2));
        assert_eq!(request.params.top_k, Some(10));
        assert_eq!(request.params.echo, Some(false));
        assert_eq!(request.params.stop, vec!["\n\n".to_string(), "Question:".to_string()]);
        assert_eq!(request.params.top_p, None);
    }

    #[test]
    fn test_missing_prompt() {
        let err = GenerationRequest::from_options(options(json!({"max_tokens": 8}))).unwrap_err();
        assert!(matches!(err, InvocationError::MissingPromptError));

        let err = GenerationRequest::from_options(Map::new()).unwrap_err();
        assert!(matches!(err, InvocationError::MissingPromptError));
    }

    #[test]
    fn test_unrecognized_options_are_dropped_with_warning() {
        let (request, logs) = capture_logs(|| {
            GenerationRequest::from_options(options(json!({
                "prompt": "hi",
                "frequency_penalty": 0.5,
                "mirostat_mode": 2,
            })))
        });
        let request = request.unwrap();

        assert!(!request.stream);
        assert_eq!(request.params, GenerationParams::default());

        let warning = logs
            .lines()
            .find(|line| line.contains("WARN"))
            .expect("dropped options should be logged");
        assert!(warning.contains("Ignoring unrecognized generation parameters"));
        assert!(warning.contains("frequency_penalty"));
        assert!(warning.contains("mirostat_mode"));
    }

    #[test]
    fn test_recognized_options_log_no_warning() {
        let (request, logs) = capture_logs(|| {
            GenerationRequest::from_options(options(json!({
                "prompt": "hi",
                "temperature": 0.2,
            })))
        });
        assert_eq!(request.unwrap().params.temperature, Some(0.2));
        assert!(!logs.contains("WARN"));
    }

    #[test]
    fn test_single_stop_string_and_bad_types() {
        let request = GenerationRequest::from_options(options(json!({
            "prompt": "hi",
            "stop": "###",
        })))
        .unwrap();
        assert_eq!(request.params.stop, vec!["###".to_string()]);

        let err = GenerationRequest::from_options(options(json!({
            "prompt": "hi",
            "max_tokens": -3,
        })))
        .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::InvalidParameter { ref name, .. } if name == "max_tokens"
        ));

        let err = GenerationRequest::from_options(options(json!({
            "prompt": "hi",
            "stream": "yes",
        })))
        .unwrap_err();
        assert!(matches!(err, InvocationError::InvalidParameter { .. }));
    }
}
