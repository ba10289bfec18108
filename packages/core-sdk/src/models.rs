use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/**
 * \brief 系统支持的三类模型服务。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }

    /**
     * \brief 启动时读取密钥所用的环境变量名。
     */
    pub fn env_key(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/**
 * \brief 模型服务凭据。
 * \details 设置了 usage_limit 时始终满足 usage_count <= usage_limit，达到上限后 active 为 false。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    /** \brief 不透明主键（UUID） */
    pub id: String,
    pub provider: ProviderKind,
    /** \brief 明文密钥，对外展示前必须脱敏 */
    pub secret: String,
    pub description: String,
    pub active: bool,
    pub usage_count: u64,
    /** \brief 可选的调用次数上限 */
    pub usage_limit: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Credential {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.usage_limit, Some(limit) if self.usage_count >= limit)
    }
}

/**
 * \brief 新建凭据的输入。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCredential {
    pub provider: ProviderKind,
    pub secret: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage_limit: Option<u64>,
}

/**
 * \brief 凭据的部分更新；字段为 None 表示保持不变。
 * \details usage_limit 使用双层 Option：Some(None) 表示清除上限。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialPatch {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub usage_count: Option<u64>,
    /** \brief 缺省保持不变，显式 null 清除上限 */
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_limit: Option<Option<u64>>,
}

/**
 * \brief 字段出现即为 Some：null 对应 Some(None)；字段缺失由 serde(default) 给出 None。
 */
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/**
 * \brief 脱敏后的凭据视图，用于管理端列表。
 */
#[derive(Debug, Clone, Serialize)]
pub struct RedactedCredential {
    pub id: String,
    pub provider: ProviderKind,
    pub masked_secret: String,
    pub description: String,
    pub active: bool,
    pub usage_count: u64,
    pub usage_limit: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Credential> for RedactedCredential {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id.clone(),
            provider: c.provider,
            masked_secret: crate::keys::mask_secret(&c.secret),
            description: c.description.clone(),
            active: c.active,
            usage_count: c.usage_count,
            usage_limit: c.usage_limit,
            last_used_at: c.last_used_at,
            created_at: c.created_at,
        }
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

/**
 * \brief 单次生成请求，与具体模型服务无关。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system: Option<String>,
    /** \brief 首选服务名，未知名称会被忽略 */
    pub preferred_provider: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /** \brief 调用方标签，仅用于日志 */
    pub context_tag: Option<String>,
}

impl ProviderRequest {
    /**
     * \brief 展开为消息列表：可选 system + user。
     */
    pub fn messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(2);
        if let Some(system) = self.system.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push(Message {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        out.push(Message {
            role: "user".to_string(),
            content: self.prompt.clone(),
        });
        out
    }

    pub fn input_chars(&self) -> usize {
        self.prompt.chars().count() + self.system.as_deref().map_or(0, |s| s.chars().count())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /** \brief 服务未返回用量时按字符数估算 */
    pub estimated: bool,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: false,
        }
    }

    /**
     * \brief 按 字符数 ÷ 4（向上取整）估算用量。
     */
    pub fn estimate(input_chars: usize, output_chars: usize) -> Self {
        let prompt = approx_tokens(input_chars);
        let completion = approx_tokens(output_chars);
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            estimated: true,
        }
    }
}

fn approx_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    /** \brief 实际完成调用的服务 */
    pub provider: ProviderKind,
    pub model: String,
    pub usage: TokenUsage,
}
