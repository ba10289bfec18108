use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::AiError;
use crate::llm::ProviderAdapter;
use crate::models::{ProviderKind, ProviderRequest, ProviderResponse};

/**
 * \brief 按优先级依次尝试各服务，返回第一个成功结果。
 * \details 同一请求内严格串行；凭据缺失/超时/上游错误切换下一个，其余错误立即返回。
 */
pub struct FallbackOrchestrator {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    priority: Vec<ProviderKind>,
}

impl FallbackOrchestrator {
    /**
     * \brief 优先级中未列出的服务按默认顺序追加到末尾，每个服务都在全局链中出现一次。
     */
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, priority: Vec<ProviderKind>) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        let mut full = Vec::with_capacity(ProviderKind::ALL.len());
        for kind in priority.into_iter().chain(ProviderKind::ALL) {
            if !full.contains(&kind) {
                full.push(kind);
            }
        }
        Self {
            adapters,
            priority: full,
        }
    }

    pub fn priority(&self) -> &[ProviderKind] {
        &self.priority
    }

    /**
     * \brief 计算本次请求的回退链：首选服务在前，其余按全局优先级，去重。
     */
    pub fn chain(&self, preferred: Option<&str>) -> Vec<ProviderKind> {
        let mut chain = Vec::with_capacity(self.priority.len() + 1);
        if let Some(name) = preferred {
            match name.parse::<ProviderKind>() {
                Ok(kind) => chain.push(kind),
                Err(e) => warn!(preferred = name, error = %e, "ignoring unknown preferred provider"),
            }
        }
        for kind in &self.priority {
            if !chain.contains(kind) {
                chain.push(*kind);
            }
        }
        chain.retain(|kind| self.adapters.contains_key(kind));
        chain
    }

    #[instrument(
        name = "generate",
        skip_all,
        fields(context = request.context_tag.as_deref().unwrap_or("-"))
    )]
    pub async fn generate(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AiError> {
        let chain = self.chain(request.preferred_provider.as_deref());
        let mut attempted = Vec::with_capacity(chain.len());
        let mut last_error = None;

        for kind in chain {
            let Some(adapter) = self.adapters.get(&kind) else {
                continue;
            };
            attempted.push(kind);
            match adapter.generate(request, cancel).await {
                Ok(response) => {
                    info!(
                        provider = %kind,
                        attempt = attempted.len(),
                        tokens = response.usage.total_tokens,
                        "generation succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(provider = %kind, error = %e, "provider failed, advancing fallback chain");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_error
            .unwrap_or_else(|| AiError::InvalidRequest("fallback chain is empty".to_string()));
        warn!(attempts = attempted.len(), "all providers exhausted");
        Err(AiError::AllProvidersExhausted {
            attempted,
            last: Box::new(last),
        })
    }
}
