//! Error type of the invocation layer and the engines behind it

use std::error::Error as StdError;

/// Result type for invocation and engine operations
pub type Result<T> = std::result::Result<T, InvocationError>;

/// Errors raised by the invocation layer and the engines behind it.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The layer was constructed with an unusable config
    #[error("Configuration error for {parameter}: {message}")]
    ConfigurationError {
        /// What is wrong with the value
        message: String,
        /// Config field at fault
        parameter: String,
    },

    /// The prompt is not plain text
    #[error("Prompt must be of type {expected} but got {actual}")]
    InvalidInputType {
        /// Representation the layer accepts
        expected: &'static str,
        /// Representation that was supplied
        actual: String,
    },

    /// The request carried no prompt
    #[error("No prompt was supplied to the invocation layer")]
    MissingPromptError,

    /// A recognized generation parameter has the wrong type or value
    #[error("Invalid value for generation parameter {name}: {message}")]
    InvalidParameter {
        /// Parameter name as given in the request
        name: String,
        /// Why the value was rejected
        message: String,
    },

    /// Encoding or decoding failed
    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    /// Loading or running the model failed
    #[error("Model error: {message}")]
    ModelError {
        /// What the engine was doing
        message: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl InvocationError {
    pub(crate) fn configuration(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        InvocationError::ConfigurationError {
            message: message.into(),
            parameter: parameter.into(),
        }
    }

    pub(crate) fn model(message: impl Into<String>) -> Self {
        InvocationError::ModelError {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn model_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        InvocationError::ModelError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the error was caused by how the layer was called rather than by the engine.
    ///
    /// None of these are worth retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            InvocationError::ConfigurationError { .. }
                | InvocationError::InvalidInputType { .. }
                | InvocationError::MissingPromptError
                | InvocationError::InvalidParameter { .. }
        )
    }
}

impl From<candle_core::Error> for InvocationError {
    fn from(err: candle_core::Error) -> Self {
        InvocationError::model_with_source("candle operation failed", err)
    }
}
