use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AppConfig, ProviderSettings};
use crate::error::AiError;
use crate::keys::KeySelector;
use crate::models::{Message, ProviderKind, ProviderRequest, ProviderResponse, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 2000;

/**
 * \brief 模型服务适配器：把通用请求翻译为各家协议，并统一成功/失败形态。
 */
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    async fn generate(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AiError>;
}

/**
 * \brief 基于 HTTP 的适配器，每个服务一个实例。
 */
pub struct ProviderClient {
    kind: ProviderKind,
    client: reqwest::Client,
    api_base: String,
    model: String,
    keys: KeySelector,
    deadline: Duration,
    limiter: Option<Arc<Semaphore>>,
}

impl ProviderClient {
    pub fn new(
        kind: ProviderKind,
        settings: &ProviderSettings,
        keys: KeySelector,
        deadline: Duration,
    ) -> Self {
        Self {
            kind,
            client: reqwest::Client::new(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            keys,
            deadline,
            limiter: None,
        }
    }

    /**
     * \brief 限制同一服务的并发调用数。
     */
    pub fn with_concurrency_limit(mut self, max: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max)));
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_call(
        &self,
        secret: &str,
        request: &ProviderRequest,
    ) -> Result<reqwest::RequestBuilder, AiError> {
        let messages = request.messages();
        let builder = match self.kind {
            ProviderKind::OpenAi => {
                let url = format!("{}/v1/chat/completions", self.api_base);
                let body = json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": request.temperature,
                    "max_tokens": request.max_tokens,
                    "stream": false
                });
                self.client
                    .post(url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(AUTHORIZATION, format!("Bearer {}", secret))
                    .json(&body)
            }
            ProviderKind::Anthropic => {
                let url = format!("{}/v1/messages", self.api_base);
                let (system_prompt, payload_messages) = anthropic_payload(&messages);
                let mut body = json!({
                    "model": self.model,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                    "messages": payload_messages,
                });
                if let Some(sys) = system_prompt {
                    body["system"] = json!(sys);
                }

                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert(
                    "x-api-key",
                    HeaderValue::from_str(secret).map_err(|_| AiError::Upstream {
                        provider: self.kind,
                        status: None,
                        body: "credential contains characters not allowed in a header".to_string(),
                    })?,
                );
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
                self.client.post(url).headers(headers).json(&body)
            }
            ProviderKind::Gemini => {
                let base = normalize_gemini_base(&self.api_base);
                let url = format!("{}/models/{}:generateContent", base, self.model);
                let (system_prompt, contents) = gemini_payload(&messages);

                let mut body = json!({
                    "contents": contents,
                    "generationConfig": {
                        "temperature": request.temperature,
                        "maxOutputTokens": request.max_tokens,
                    }
                });
                if let Some(sys) = system_prompt {
                    body["system_instruction"] = json!({
                        "parts": [{"text": sys}]
                    });
                }
                self.client
                    .post(url)
                    .query(&[("key", secret)])
                    .json(&body)
            }
        };
        Ok(builder)
    }

    /**
     * \brief 在截止时间与取消令牌约束下发送请求；超时或取消时请求 future 被丢弃，连接随之中断。
     */
    async fn send_bounded(
        &self,
        builder: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<(reqwest::StatusCode, String), AiError> {
        let call = async {
            let resp = builder.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AiError::Cancelled),
            outcome = tokio::time::timeout(self.deadline, call) => match outcome {
                Err(_) => Err(AiError::Timeout {
                    provider: self.kind,
                    after: self.deadline,
                }),
                // 请求 URL 可能带有密钥（Gemini 的 ?key=），错误文本中去掉 URL
                Ok(Err(e)) => Err(AiError::Upstream {
                    provider: self.kind,
                    status: e.status().map(|s| s.as_u16()),
                    body: e.without_url().to_string(),
                }),
                Ok(Ok(pair)) => Ok(pair),
            },
        }
    }

    fn normalize(&self, request: &ProviderRequest, raw: String) -> Result<ProviderResponse, AiError> {
        let v: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                return Err(AiError::MalformedResponse {
                    provider: Some(self.kind),
                    reason: format!("response is not JSON: {}", e),
                    raw,
                })
            }
        };
        let text = match self.kind {
            ProviderKind::OpenAi => extract_openai_content(&v),
            ProviderKind::Anthropic => extract_anthropic_content(&v),
            ProviderKind::Gemini => extract_gemini_content(&v),
        };
        let Some(text) = text else {
            return Err(AiError::MalformedResponse {
                provider: Some(self.kind),
                reason: "response has no text content".to_string(),
                raw,
            });
        };
        let usage = match self.kind {
            ProviderKind::OpenAi => openai_usage(&v),
            ProviderKind::Anthropic => anthropic_usage(&v),
            ProviderKind::Gemini => gemini_usage(&v),
        }
        .unwrap_or_else(|| TokenUsage::estimate(request.input_chars(), text.chars().count()));

        Ok(ProviderResponse {
            text,
            provider: self.kind,
            model: self.model.clone(),
            usage,
        })
    }
}

#[async_trait]
impl ProviderAdapter for ProviderClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AiError> {
        if cancel.is_cancelled() {
            return Err(AiError::Cancelled);
        }

        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AiError::Cancelled),
                permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let key = self
            .keys
            .acquire(self.kind)
            .await?
            .ok_or(AiError::MissingCredential {
                provider: self.kind,
            })?;
        debug!(
            provider = %self.kind,
            credential = %key.credential_id,
            model = %self.model,
            "calling provider"
        );

        let builder = self.build_call(&key.secret, request)?;
        let (status, body) = self.send_bounded(builder, cancel).await?;
        if !status.is_success() {
            warn!(provider = %self.kind, status = status.as_u16(), "provider returned an error status");
            return Err(AiError::Upstream {
                provider: self.kind,
                status: Some(status.as_u16()),
                body: truncate_body(body),
            });
        }
        self.normalize(request, body)
    }
}

/**
 * \brief 按配置为每个服务构造一个适配器。
 */
pub fn build_adapters(config: &AppConfig, keys: &KeySelector) -> Vec<Arc<dyn ProviderAdapter>> {
    ProviderKind::ALL
        .into_iter()
        .map(|kind| {
            let mut client = ProviderClient::new(
                kind,
                config.providers.get(kind),
                keys.clone(),
                config.request_timeout(),
            );
            if let Some(max) = config.max_concurrent_per_provider {
                client = client.with_concurrency_limit(max);
            }
            Arc::new(client) as Arc<dyn ProviderAdapter>
        })
        .collect()
}

fn truncate_body(body: String) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        return body;
    }
    let mut cut: String = body.chars().take(MAX_ERROR_BODY).collect();
    cut.push_str("...");
    cut
}

fn extract_openai_content(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_anthropic_content(v: &Value) -> Option<String> {
    let parts = v
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(""))
    }
}

fn extract_gemini_content(v: &Value) -> Option<String> {
    let first = v.get("candidates")?.as_array()?.first()?;
    if let Some(parts) = first
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        let texts = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>();
        if !texts.is_empty() {
            return Some(texts.join(""));
        }
    }
    first
        .get("output")
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

fn token_field(v: &Value, key: &str) -> Option<u32> {
    v.get(key)?.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn openai_usage(v: &Value) -> Option<TokenUsage> {
    let usage = v.get("usage")?;
    Some(TokenUsage::new(
        token_field(usage, "prompt_tokens")?,
        token_field(usage, "completion_tokens")?,
    ))
}

fn anthropic_usage(v: &Value) -> Option<TokenUsage> {
    let usage = v.get("usage")?;
    Some(TokenUsage::new(
        token_field(usage, "input_tokens")?,
        token_field(usage, "output_tokens")?,
    ))
}

fn gemini_usage(v: &Value) -> Option<TokenUsage> {
    let usage = v.get("usageMetadata")?;
    Some(TokenUsage::new(
        token_field(usage, "promptTokenCount")?,
        token_field(usage, "candidatesTokenCount").unwrap_or(0),
    ))
}

fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => items.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": msg.content}]
            })),
            _ => items.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}

fn gemini_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => contents.push(json!({
                "role": "model",
                "parts": [{"text": msg.content}]
            })),
            _ => contents.push(json!({
                "role": "user",
                "parts": [{"text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, contents)
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
