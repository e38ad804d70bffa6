//! Classification drivers.
//!
//! A driver sends document text and a JSON Schema to a model and returns the
//! structured response. Drivers report whether a failure is worth retrying
//! through [`RetryResult`]. The classification stage owns the retry loop.

use std::{error, fmt, sync::Arc};

use clap::{Args, ValueEnum};
use keen_retry::RetryResult;

use crate::{prelude::*, rate_limit::RateLimit, retry::IsKnownTransient};

pub mod echo;
pub mod openai;

/// Our different classifier types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum ClassifierType {
    /// OpenAI-compatible chat completions (also for LiteLLM, Ollama, etc).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Offline driver that fills in the schema from the text itself. Useful
    /// for testing a deployment without API keys.
    Echo,
}

impl ClassifierType {
    /// Instantiate an appropriate driver.
    pub fn create_classifier(&self, model: &str, llm_opts: &LlmOpts) -> Result<Arc<dyn Classifier>> {
        match self {
            ClassifierType::OpenAI => Ok(Arc::new(openai::OpenAiClassifier::new(
                model, llm_opts,
            )?)),
            ClassifierType::Echo => Ok(Arc::new(echo::EchoClassifier)),
        }
    }
}

/// Our model-related options.
#[derive(Args, Clone, Debug, Default)]
pub struct LlmOpts {
    /// The temperature to use for sampling, between 0.0 and 2.0. Lower values
    /// make extraction more repeatable.
    #[clap(long, default_value_t = 0.1)]
    pub temperature: f32,

    /// An upper limit on the number of completion tokens to generate.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// A timeout, in seconds, for the model to return a complete response.
    /// Timeouts are retried.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Budget for classification requests, such as "10/s" or "2000/m".
    /// Overrides the config file.
    #[clap(long = "llm-rate-limit")]
    pub rate_limit: Option<RateLimit>,
}

/// A [`RetryResult`] for classification requests.
pub type ClassifyRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// One classification call.
#[derive(Debug)]
pub struct ClassifyRequest<'a> {
    /// The pass name, such as `classification` or
    /// `specific_extraction_invoice`.
    pub pass: &'a str,
    /// The name of the schema.
    pub schema_name: &'a str,
    /// The JSON Schema the response must follow.
    pub schema: &'a Value,
    /// The document text.
    pub text: &'a str,
}

/// Interface trait for classification drivers.
#[async_trait]
pub trait Classifier: fmt::Debug + Send + Sync + 'static {
    /// Extract structured data from text. The response has not been
    /// validated against the schema yet.
    async fn classify(&self, request: &ClassifyRequest<'_>) -> ClassifyRetryResult<Value>;
}

/// An error which occurred while calling a model.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and some kinds of network timeouts can be
            // retried with hope of a better result.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}
