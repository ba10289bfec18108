use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{AppConfig, ProviderSecrets};
use crate::db::{CredentialStore, SeedReport};
use crate::error::AiError;
use crate::keys::{KeySelector, ProviderKeyStatus};
use crate::llm::build_adapters;
use crate::models::{
    Credential, CredentialPatch, NewCredential, ProviderKind, ProviderRequest, ProviderResponse,
    RedactedCredential,
};
use crate::orchestrator::FallbackOrchestrator;

/**
 * \brief 业务侧的生成请求；未填写的采样参数取配置默认值。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateTextInput {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub context_tag: Option<String>,
}

/**
 * \brief 服务门面：持有凭据库、密钥选择器与回退编排器。
 * \details 由 start 显式构造；shutdown 取消服务级令牌，进行中的调用随之结束。
 */
pub struct AiService {
    config: AppConfig,
    store: CredentialStore,
    keys: KeySelector,
    orchestrator: FallbackOrchestrator,
    root: CancellationToken,
    seed_report: SeedReport,
}

impl AiService {
    /**
     * \brief 打开凭据库、写入环境变量种子凭据并组装适配器。
     * \details 种子写入完成后才返回，因此返回的服务一定已经完成引导。
     */
    pub async fn start(config: AppConfig, secrets: ProviderSecrets) -> Result<Self, AiError> {
        let store = CredentialStore::open(&config.database_path).await?;
        let seed_report = store.seed_from_config(&secrets).await;
        let keys = KeySelector::new(store.clone());
        let adapters = build_adapters(&config, &keys);
        let orchestrator = FallbackOrchestrator::new(adapters, config.priority.clone());
        info!(
            db = %config.database_path.display(),
            seeded = seed_report.seeded.len(),
            priority = ?config.priority,
            "ai service started"
        );
        Ok(Self {
            config,
            store,
            keys,
            orchestrator,
            root: CancellationToken::new(),
            seed_report,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn seed_report(&self) -> &SeedReport {
        &self.seed_report
    }

    /**
     * \brief 取消所有进行中的生成；之后的调用立即返回 Cancelled。
     */
    pub fn shutdown(&self) {
        if !self.root.is_cancelled() {
            info!("ai service shutting down");
            self.root.cancel();
        }
    }

    #[instrument(skip_all, fields(context = input.context_tag.as_deref().unwrap_or("-")))]
    pub async fn generate_text(
        &self,
        input: GenerateTextInput,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AiError> {
        if input.prompt.trim().is_empty() {
            return Err(AiError::InvalidRequest("prompt must not be empty".to_string()));
        }
        if self.root.is_cancelled() {
            return Err(AiError::Cancelled);
        }
        let request = ProviderRequest {
            prompt: input.prompt,
            system: input.system,
            preferred_provider: input.preferred_provider,
            temperature: input.temperature.unwrap_or(self.config.default_temperature),
            max_tokens: input.max_tokens.unwrap_or(self.config.default_max_tokens),
            context_tag: input.context_tag,
        };

        // 调用方令牌与服务级令牌任一取消都会中止本次调用
        let call = self.root.child_token();
        let result = tokio::select! {
            res = self.orchestrator.generate(&request, &call) => res,
            _ = cancel.cancelled() => {
                call.cancel();
                Err(AiError::Cancelled)
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "generation failed");
        }
        result
    }

    pub async fn list_credentials(&self) -> Result<Vec<RedactedCredential>, AiError> {
        let all = self.store.list_all().await?;
        Ok(all.iter().map(RedactedCredential::from).collect())
    }

    pub async fn add_credential(&self, new: NewCredential) -> Result<RedactedCredential, AiError> {
        if new.secret.trim().is_empty() {
            return Err(AiError::InvalidRequest("secret must not be empty".to_string()));
        }
        let created = self.store.add(new).await?;
        Ok(RedactedCredential::from(&created))
    }

    pub async fn update_credential(
        &self,
        id: &str,
        patch: CredentialPatch,
    ) -> Result<RedactedCredential, AiError> {
        if patch.secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(AiError::InvalidRequest("secret must not be empty".to_string()));
        }
        let updated: Credential = self.store.update(id, patch).await?;
        Ok(RedactedCredential::from(&updated))
    }

    pub async fn delete_credential(&self, id: &str) -> Result<(), AiError> {
        self.store.delete(id).await?;
        Ok(())
    }

    /**
     * \brief 按生成时的选择规则探测可用凭据，不消耗用量。
     */
    pub async fn test_provider(&self, provider: ProviderKind) -> Result<ProviderKeyStatus, AiError> {
        Ok(self.keys.probe(provider).await?)
    }
}

impl Drop for AiService {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
