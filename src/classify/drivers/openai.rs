//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use std::{fmt, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FinishReason, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use futures::{FutureExt as _, TryFutureExt as _};
use leaky_bucket::RateLimiter;
use tokio::time;

use crate::{
    classify::prompt::ClassificationPrompt,
    prelude::*,
    rate_limit::RateLimit,
    retry::{
        IntoRetryResult as _, IsKnownTransient as _, retry_result_fatal, retry_result_ok,
        try_with_retry_result,
    },
};

use super::{Classifier, ClassifyRequest, ClassifyRetryResult, LlmError, LlmOpts};

/// Create an OpenAI-compatible client from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
pub fn create_llm_client() -> Client<OpenAIConfig> {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Client::with_config(client_config)
}

/// Classifier backed by the chat completions API with structured outputs.
pub struct OpenAiClassifier {
    client: Client<OpenAIConfig>,
    model: String,
    llm_opts: LlmOpts,
    prompt: ClassificationPrompt,
    rate_limiter: Option<RateLimiter>,
}

impl fmt::Debug for OpenAiClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClassifier")
            .field("model", &self.model)
            .field("llm_opts", &self.llm_opts)
            .finish_non_exhaustive()
    }
}

impl OpenAiClassifier {
    pub fn new(model: &str, llm_opts: &LlmOpts) -> Result<Self> {
        Ok(Self {
            client: create_llm_client(),
            model: model.to_owned(),
            llm_opts: llm_opts.clone(),
            prompt: ClassificationPrompt::new()?,
            rate_limiter: llm_opts.rate_limit.as_ref().map(RateLimit::limiter),
        })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    #[instrument(level = "debug", skip_all, fields(pass = %request.pass))]
    async fn classify(&self, request: &ClassifyRequest<'_>) -> ClassifyRetryResult<Value> {
        let prompt = try_with_retry_result!(
            self.prompt
                .render(request.schema_name, request.schema, request.text)
                .into_fatal()
        );
        let system = try_with_retry_result!(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt.system)
                .build()
                .context("Error building system message")
                .into_fatal()
        );
        let user = try_with_retry_result!(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.user)
                .build()
                .context("Error building user message")
                .into_fatal()
        );
        let messages: Vec<ChatCompletionRequestMessage> = vec![system.into(), user.into()];

        // Build our JSON Schema options.
        let json_schema = ResponseFormatJsonSchema {
            name: request.schema_name.to_owned(),
            schema: Some(request.schema.clone()),
            strict: Some(true),
            description: None,
        };

        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(self.model.clone())
            .messages(messages)
            .response_format(ResponseFormat::JsonSchema { json_schema })
            .temperature(self.llm_opts.temperature)
            // Don't keep our documents around on the provider's side.
            .store(false);
        if let Some(max_completion_tokens) = self.llm_opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        let req = try_with_retry_result!(
            req.build().context("Error building request").into_fatal()
        );
        trace!(?req, "Request");

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        // Call OpenAI.
        let chat = self.client.chat();
        let mut chat_future = chat.create_byot(req).map_err(LlmError::Native).boxed();
        if let Some(timeout) = self.llm_opts.timeout {
            // If we have a timeout, wrap our future in a timeout, and merge the errors
            // from the `Result<Result<_, LlmError>, Elapsed>` into a single level.
            chat_future = time::timeout(Duration::from_secs(timeout), chat_future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed();
        }
        let chat_result: Value = try_with_retry_result!(
            chat_future
                .await
                .into_retry_result(|err| err.is_known_transient())
        );
        debug!(%chat_result, "OpenAI response");
        let response = try_with_retry_result!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
                .into_fatal()
        );

        // Get the content from our response & parse as JSON.
        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        let response = try_with_retry_result!(
            serde_json::from_str::<Value>(content)
                .with_context(|| format!("Error parsing OpenAI response content: {content:?}"))
                // If we didn't get JSON here, it's because the model didn't
                // generate JSON. So give it another chance.
                .into_transient()
        );
        retry_result_ok(response)
    }
}
