use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::CredentialStore;
use crate::error::StoreError;
use crate::models::ProviderKind;

/**
 * \brief 选中的密钥，仅在调用链内部流转，不得写入日志。
 */
#[derive(Clone)]
pub struct SelectedKey {
    pub credential_id: String,
    pub provider: ProviderKind,
    pub secret: String,
    /** \brief 本次调用记录后的累计用量 */
    pub usage_count: u64,
    pub remaining: Option<u64>,
}

impl std::fmt::Debug for SelectedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedKey")
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .field("secret", &mask_secret(&self.secret))
            .field("usage_count", &self.usage_count)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/**
 * \brief 管理端“测试”结果：只含脱敏密钥。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ProviderKeyStatus {
    pub provider: ProviderKind,
    pub available: bool,
    pub credential_id: Option<String>,
    pub masked_secret: Option<String>,
    pub active_credentials: usize,
}

/**
 * \brief 为指定服务挑选凭据并记录用量。
 * \details 策略：启用凭据按创建时间倒序取第一条；条件更新失败（并发耗尽）时顺延下一条。
 */
#[derive(Debug, Clone)]
pub struct KeySelector {
    store: CredentialStore,
}

impl KeySelector {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /**
     * \brief 选取并消耗一次用量。
     * \return 无可用凭据时返回 Ok(None)，调用方应切换到下一个服务。
     */
    pub async fn acquire(&self, provider: ProviderKind) -> Result<Option<SelectedKey>, StoreError> {
        let candidates = self.store.list_active_by_provider(provider).await?;
        for candidate in candidates {
            match self.store.record_usage(&candidate.id).await? {
                Some(used) => {
                    if !used.active {
                        info!(
                            provider = %provider,
                            credential = %used.id,
                            usage = used.usage_count,
                            "credential reached its usage limit and was deactivated"
                        );
                    }
                    debug!(provider = %provider, credential = %used.id, "credential selected");
                    return Ok(Some(SelectedKey {
                        remaining: used
                            .usage_limit
                            .map(|limit| limit.saturating_sub(used.usage_count)),
                        credential_id: used.id,
                        provider,
                        secret: used.secret,
                        usage_count: used.usage_count,
                    }));
                }
                None => {
                    debug!(
                        provider = %provider,
                        credential = %candidate.id,
                        "credential exhausted concurrently, trying next"
                    );
                }
            }
        }
        warn!(provider = %provider, "no active credential available");
        Ok(None)
    }

    /**
     * \brief 与 acquire 相同的选择逻辑，但不记录用量。
     */
    pub async fn probe(&self, provider: ProviderKind) -> Result<ProviderKeyStatus, StoreError> {
        let active = self.store.list_active_by_provider(provider).await?;
        let first = active.first();
        Ok(ProviderKeyStatus {
            provider,
            available: first.is_some(),
            credential_id: first.map(|c| c.id.clone()),
            masked_secret: first.map(|c| mask_secret(&c.secret)),
            active_credentials: active.len(),
        })
    }
}

/**
 * \brief 密钥脱敏：两端各保留 min(4, 长度/4) 个字符。
 * \details 长度 >= 16 时显示前 4 后 4；不足 4 个字符时完全隐藏。
 */
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let reveal = (chars.len() / 4).min(4);
    if reveal == 0 {
        return "****".to_string();
    }
    let head: String = chars[..reveal].iter().collect();
    let tail: String = chars[chars.len() - reveal..].iter().collect();
    format!("{}...{}", head, tail)
}
