//! Chat providers and the fallback chain
//!
//! Each configured API key becomes one [`ChatProvider`]. The
//! [`ProviderChain`] tries them in priority order and is the only
//! [`GenerationCapability`] the binaries use. A provider answering
//! HTTP 429 sits out a cooldown before it is tried again.

use crate::config::{parse_keys, GeneratorConfig};
use crate::error::GenerationError;
use crate::generator::{Completion, GenerationCapability, GenerationRequest};
use crate::prompt::PromptBuilder;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::{Duration, Instant};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Wire format spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    /// Anthropic Messages
    Anthropic,
    /// OpenAI-compatible Chat Completions
    OpenAi,
}

/// Where a provider's keys live and, when it speaks the OpenAI format, its base URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Endpoint {
    key_var: &'static str,
    base_url: Option<&'static str>,
}

fn endpoint(name: &str) -> Option<Endpoint> {
    let (key_var, base_url) = match name {
        "anthropic" => ("ANTHROPIC_API_KEY", None),
        "groq" => ("GROQ_API_KEYS", Some("https://api.groq.com/openai/v1")),
        "gemini" => (
            "GEMINI_API_KEYS",
            Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        ),
        "huggingface" => ("HF_API_KEYS", Some("https://router.huggingface.co/v1")),
        "openrouter" => ("OPENROUTER_API_KEYS", Some("https://openrouter.ai/api/v1")),
        _ => return None,
    };
    Some(Endpoint { key_var, base_url })
}

/// One API key at one provider
pub struct ChatProvider {
    name: String,
    format: ApiFormat,
    api_key: String,
    model: String,
    url: String,
    temperature: f64,
    max_tokens: u32,
    client: Client,
    cooldown_until: Option<Instant>,
}

impl ChatProvider {
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_url("anthropic", ApiFormat::Anthropic, api_key, model, ANTHROPIC_URL)
    }

    /// OpenAI-compatible endpoint; `base_url` excludes `/chat/completions`
    pub fn openai_compatible(
        name: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: &str,
    ) -> Self {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Self::with_url(name, ApiFormat::OpenAi, api_key, model, url)
    }

    fn with_url(
        name: impl Into<String>,
        format: ApiFormat,
        api_key: impl Into<String>,
        model: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            name: name.into(),
            format,
            api_key: api_key.into(),
            model: model.into(),
            url: url.into(),
            temperature: 0.5,
            max_tokens: 2048,
            client,
            cooldown_until: None,
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn start_cooldown(&mut self, now: Instant, cooldown: Duration) {
        self.cooldown_until = Some(now + cooldown);
    }

    /// Send one chat request and return the model's text
    pub fn complete(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let request = match self.format {
            ApiFormat::Anthropic => self
                .client
                .post(&self.url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&serde_json::json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "system": system,
                    "messages": [{"role": "user", "content": prompt}]
                })),
            ApiFormat::OpenAi => self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": prompt}
                    ]
                })),
        };

        let response = request
            .send()
            .map_err(|e| GenerationError::Request(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited { provider: self.name.clone() });
        }
        let body = response
            .text()
            .map_err(|e| GenerationError::Request(format!("failed to read {} response: {}", self.name, e)))?;
        if !status.is_success() {
            return Err(GenerationError::Request(format!(
                "{} API error ({}): {}",
                self.name, status, body
            )));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Request(format!("failed to parse {} response: {}", self.name, e)))?;
        extract_text(self.format, &json).ok_or_else(|| {
            GenerationError::Request(format!("unexpected {} response format: {}", self.name, json))
        })
    }
}

fn extract_text(format: ApiFormat, json: &Value) -> Option<String> {
    let text = match format {
        ApiFormat::Anthropic => json["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block["text"].as_str()),
        ApiFormat::OpenAi => json["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str()),
    };
    text.map(String::from)
}

/// Priority-ordered providers with automatic fallback
pub struct ProviderChain {
    providers: Vec<ChatProvider>,
    cooldown: Duration,
}

impl ProviderChain {
    pub fn new(providers: Vec<ChatProvider>, cooldown: Duration) -> Self {
        Self { providers, cooldown }
    }

    /// One provider per configured key, in `provider_priority` order
    pub fn from_config(config: &GeneratorConfig) -> anyhow::Result<Self> {
        let mut providers = Vec::new();

        for name in &config.provider_priority {
            let (Some(route), Some(model)) = (endpoint(name), config.models.for_provider(name)) else {
                tracing::warn!("Unknown provider in priority list: {}", name);
                continue;
            };

            for key in parse_keys(route.key_var) {
                let provider = match route.base_url {
                    Some(base_url) => ChatProvider::openai_compatible(name.as_str(), key, model, base_url),
                    None => ChatProvider::anthropic(key, model),
                };
                providers.push(
                    provider
                        .temperature(config.temperature)
                        .max_tokens(config.max_tokens),
                );
            }
            tracing::info!(
                "Provider {}: {} key(s)",
                name,
                providers.iter().filter(|p| p.name() == name).count()
            );
        }

        if providers.is_empty() {
            anyhow::bail!(
                "No API keys configured for any provider. Set GROQ_API_KEYS, GEMINI_API_KEYS, \
                 HF_API_KEYS, OPENROUTER_API_KEYS or ANTHROPIC_API_KEY."
            );
        }

        Ok(Self::new(providers, Duration::from_secs(config.rate_limit_cooldown_secs)))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl GenerationCapability for ProviderChain {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Completion, GenerationError> {
        let system = PromptBuilder::system_prompt(&request.system_context);
        let prompt = PromptBuilder::generation_prompt(request);
        let mut tried = 0;

        for provider in self.providers.iter_mut() {
            let now = Instant::now();
            if provider.is_cooling_down(now) {
                tracing::debug!("Skipping {} (rate-limit cooldown)", provider.name());
                continue;
            }
            tried += 1;

            match provider.complete(&system, &prompt) {
                Ok(text) => {
                    return Ok(Completion {
                        text,
                        provider: Some(provider.name().to_string()),
                        model: Some(provider.model().to_string()),
                    });
                }
                Err(GenerationError::RateLimited { provider: name }) => {
                    tracing::warn!("{} rate limited; cooling down for {:?}", name, self.cooldown);
                    provider.start_cooldown(now, self.cooldown);
                }
                Err(e) => tracing::warn!("{} failed: {}", provider.name(), e),
            }
        }

        Err(GenerationError::Runtime(format!(
            "all providers failed ({} tried, {} cooling down)",
            tried,
            self.providers.len() - tried
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Difficulty;

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_context: String::new(),
            intents: Vec::new(),
            reference_questions: Vec::new(),
            difficulty: Difficulty::Hard,
            running_count: 0,
            batch_size: 1,
        }
    }

    #[test]
    fn test_extract_text() {
        let anthropic = serde_json::json!({"content": [{"type": "text", "text": "[]"}]});
        assert_eq!(extract_text(ApiFormat::Anthropic, &anthropic).as_deref(), Some("[]"));

        let openai = serde_json::json!({"choices": [{"message": {"content": "[1]"}}]});
        assert_eq!(extract_text(ApiFormat::OpenAi, &openai).as_deref(), Some("[1]"));
        assert_eq!(extract_text(ApiFormat::OpenAi, &anthropic), None);
    }

    #[test]
    fn test_openai_url_joins_path() {
        let p = ChatProvider::openai_compatible("groq", "k", "m", "https://api.groq.com/openai/v1/");
        assert_eq!(p.url, "https://api.groq.com/openai/v1/chat/completions");
        assert_eq!(p.format, ApiFormat::OpenAi);
    }

    #[test]
    fn test_endpoint_table_covers_configured_providers() {
        let config = GeneratorConfig::default();
        for name in &config.provider_priority {
            assert!(endpoint(name).is_some(), "{}", name);
            assert!(config.models.for_provider(name).is_some(), "{}", name);
        }

        let anthropic = endpoint("anthropic").unwrap();
        assert_eq!(anthropic.key_var, "ANTHROPIC_API_KEY");
        assert_eq!(anthropic.base_url, None);
        assert_eq!(endpoint("huggingface").unwrap().key_var, "HF_API_KEYS");
        assert!(endpoint("mistral").is_none());
    }

    #[test]
    fn test_cooldown_window() {
        let mut p = ChatProvider::anthropic("k", "m");
        let now = Instant::now();
        assert!(!p.is_cooling_down(now));
        p.start_cooldown(now, Duration::from_secs(120));
        assert!(p.is_cooling_down(now + Duration::from_secs(60)));
        assert!(!p.is_cooling_down(now + Duration::from_secs(121)));
    }

    #[test]
    fn test_chain_reports_runtime_when_everything_cools_down() {
        let mut p = ChatProvider::anthropic("k", "m");
        p.start_cooldown(Instant::now(), Duration::from_secs(3600));
        let mut chain = ProviderChain::new(vec![p], Duration::from_secs(120));

        match chain.generate(&request()) {
            Err(GenerationError::Runtime(msg)) => assert!(msg.contains("0 tried")),
            other => panic!("expected runtime failure, got {:?}", other.map(|c| c.text)),
        }
    }

    #[test]
    fn test_unreachable_provider_falls_through() {
        // nothing listens on the discard port
        let p = ChatProvider::openai_compatible("local", "k", "m", "http://127.0.0.1:9");
        let mut chain = ProviderChain::new(vec![p], Duration::from_secs(120));
        assert!(matches!(chain.generate(&request()), Err(GenerationError::Runtime(_))));
    }
}
