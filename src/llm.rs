use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::{ModelConfig, ProviderKind};
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub total_tokens: u64,
    pub duration: Duration,
}

/// Uniform LLM contract, implemented against an OpenAI-compatible
/// chat-completions surface by two provider backends (§4.6).
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<GenerationResult, EngineError>;
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

async fn call_chat_completions(
    http: &reqwest::Client,
    endpoint_base_url: &str,
    api_key: &str,
    model: &str,
    prompt: &str,
    max_tokens: u32,
    temperature: f64,
    timeout: Duration,
) -> Result<GenerationResult, EngineError> {
    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": max_tokens,
        "temperature": temperature,
    });

    let started = Instant::now();
    let resp = http
        .post(format!("{endpoint_base_url}/chat/completions"))
        .bearer_auth(api_key)
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| if e.is_timeout() { EngineError::Network("request timed out".to_string()) } else { EngineError::Network(e.to_string()) })?;

    if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 {
        return Err(EngineError::Auth(format!("provider rejected credentials ({})", resp.status())));
    }
    if resp.status().as_u16() == 429 {
        return Err(EngineError::RateLimited);
    }
    if resp.status().is_server_error() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(EngineError::Transient5xx { status, body });
    }

    let parsed: ChatCompletionResponse = resp.json().await.map_err(|e| EngineError::Network(e.to_string()))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| EngineError::DataUnavailable("provider returned no choices".to_string()))?;

    Ok(GenerationResult {
        text,
        total_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        duration: started.elapsed(),
    })
}

/// First-party HyperLiquid-recommended model endpoint.
pub struct OfficialApiProvider {
    http: reqwest::Client,
    config: ModelConfig,
    api_key: String,
}

impl OfficialApiProvider {
    pub fn new(http: reqwest::Client, config: ModelConfig, api_key: String) -> Self {
        Self { http, config, api_key }
    }
}

#[async_trait]
impl LLMProvider for OfficialApiProvider {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<GenerationResult, EngineError> {
        call_chat_completions(
            &self.http,
            &self.config.endpoint_base_url,
            &self.api_key,
            &self.config.provider_model_name,
            prompt,
            max_tokens,
            temperature,
            Duration::from_secs(self.config.timeout_seconds),
        )
        .await
    }
}

/// OpenRouter-hosted model endpoint; same wire shape, different base URL.
pub struct OpenRouterProvider {
    http: reqwest::Client,
    config: ModelConfig,
    api_key: String,
}

impl OpenRouterProvider {
    pub fn new(http: reqwest::Client, config: ModelConfig, api_key: String) -> Self {
        Self { http, config, api_key }
    }
}

#[async_trait]
impl LLMProvider for OpenRouterProvider {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<GenerationResult, EngineError> {
        call_chat_completions(
            &self.http,
            &self.config.endpoint_base_url,
            &self.api_key,
            &self.config.provider_model_name,
            prompt,
            max_tokens,
            temperature,
            Duration::from_secs(self.config.timeout_seconds),
        )
        .await
    }
}

/// Retries up to 3 attempts with exponential backoff on transient failures,
/// matching ExchangeExecutor's retry shape (§4.2/§4.6).
pub async fn generate_with_retry(
    provider: &dyn LLMProvider,
    prompt: &str,
    max_tokens: u32,
    temperature: f64,
) -> Result<GenerationResult, EngineError> {
    let mut attempt = 0u32;
    loop {
        match provider.generate(prompt, max_tokens, temperature).await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_retryable() && attempt < 2 => {
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                log::warn!("llm call failed ({e}), retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Looks up the environment variable named by `api_key_ref`; never accepts
/// the secret itself from config (§3's config-loading note).
pub fn resolve_api_key(config: &ModelConfig) -> Result<String, EngineError> {
    std::env::var(&config.api_key_ref)
        .map_err(|_| EngineError::Configuration(format!("environment variable {} is not set", config.api_key_ref)))
}

/// Constructs the LLMProvider matching a model's configured provider_kind.
pub fn build_provider(http: reqwest::Client, config: ModelConfig) -> Result<Box<dyn LLMProvider>, EngineError> {
    let api_key = resolve_api_key(&config)?;
    match config.provider_kind {
        ProviderKind::Official => Ok(Box::new(OfficialApiProvider::new(http, config, api_key))),
        ProviderKind::OpenRouter => Ok(Box::new(OpenRouterProvider::new(http, config, api_key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyThenOk {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LLMProvider for FlakyThenOk {
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f64) -> Result<GenerationResult, EngineError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(EngineError::Network("flaky".to_string()))
            } else {
                Ok(GenerationResult { text: "ok".to_string(), total_tokens: 10, duration: Duration::from_millis(1) })
            }
        }
    }

    struct AlwaysAuthFails;

    #[async_trait]
    impl LLMProvider for AlwaysAuthFails {
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f64) -> Result<GenerationResult, EngineError> {
            Err(EngineError::Auth("bad key".to_string()))
        }
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let provider = FlakyThenOk { calls: std::sync::atomic::AtomicU32::new(0) };
        let result = generate_with_retry(&provider, "prompt", 100, 0.3).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    #[tokio::test]
    async fn does_not_retry_fatal_auth_error() {
        let provider = AlwaysAuthFails;
        let err = generate_with_retry(&provider, "prompt", 100, 0.3).await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
    }
}
