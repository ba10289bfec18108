use std::time::Duration;

use crate::models::ProviderKind;

/**
 * \brief 凭据存储层错误，统一视为持久化故障。
 */
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("credential {0} not found")]
    NotFound(String),

    #[error("corrupt credential row: {0}")]
    Corrupt(String),

    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/**
 * \brief 模型调用链路的错误分类。
 */
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("no active credential for {provider}")]
    MissingCredential { provider: ProviderKind },

    #[error("{provider} did not answer within {}s", .after.as_secs_f32())]
    Timeout {
        provider: ProviderKind,
        after: Duration,
    },

    #[error("{provider} upstream error{}: {body}", status_suffix(.status))]
    Upstream {
        provider: ProviderKind,
        status: Option<u16>,
        body: String,
    },

    /** \brief 成功响应但无法解析；附带原文供调用方按字段兜底 */
    #[error("malformed response{}: {reason}", provider_suffix(.provider))]
    MalformedResponse {
        provider: Option<ProviderKind>,
        reason: String,
        raw: String,
    },

    #[error("all providers exhausted ({}), last error: {last}", join_kinds(.attempted))]
    AllProvidersExhausted {
        attempted: Vec<ProviderKind>,
        last: Box<AiError>,
    },

    #[error("credential store failure: {0}")]
    Durability(#[from] StoreError),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AiError {
    /**
     * \brief 是否应切换到回退链中的下一个服务。
     */
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AiError::MissingCredential { .. } | AiError::Timeout { .. } | AiError::Upstream { .. }
        )
    }

    /**
     * \brief 面向最终用户的非技术性提示。
     */
    pub fn user_message(&self) -> &'static str {
        match self {
            AiError::AllProvidersExhausted { .. }
            | AiError::MissingCredential { .. }
            | AiError::Timeout { .. }
            | AiError::Upstream { .. } => {
                "The AI assistant is temporarily unavailable. Please try again in a few minutes."
            }
            AiError::MalformedResponse { .. } => {
                "The AI assistant returned an answer that could not be read. Please try again."
            }
            AiError::Durability(_) => {
                "The AI service could not reach its configuration store. Support has been notified."
            }
            AiError::Cancelled => "The request was cancelled.",
            AiError::InvalidRequest(_) => "The request was incomplete. Please check your input.",
        }
    }

    /**
     * \brief 成功响应但内容无法识别时附带的原文。
     */
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            AiError::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

fn provider_suffix(provider: &Option<ProviderKind>) -> String {
    provider.map(|p| format!(" from {}", p)).unwrap_or_default()
}

fn join_kinds(kinds: &[ProviderKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(AiError::MissingCredential {
            provider: ProviderKind::OpenAi
        }
        .is_recoverable());
        assert!(AiError::Upstream {
            provider: ProviderKind::Gemini,
            status: Some(503),
            body: "overloaded".into()
        }
        .is_recoverable());
        assert!(!AiError::MalformedResponse {
            provider: None,
            reason: "x".into(),
            raw: "x".into()
        }
        .is_recoverable());
        assert!(!AiError::Durability(StoreError::NotFound("k".into())).is_recoverable());
        assert!(!AiError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_exhausted_message_names_last_cause() {
        let err = AiError::AllProvidersExhausted {
            attempted: vec![ProviderKind::OpenAi, ProviderKind::Gemini],
            last: Box::new(AiError::Upstream {
                provider: ProviderKind::Gemini,
                status: Some(500),
                body: "boom".into(),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("openai -> gemini"));
        assert!(text.contains("gemini upstream error (500): boom"));
    }
}
