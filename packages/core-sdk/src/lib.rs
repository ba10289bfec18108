pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod scrape;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod test_support;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::config::{AppConfig, ProviderSecrets};
    pub use crate::error::{AiError, StoreError};
    pub use crate::models::{
        CredentialPatch, NewCredential, ProviderKind, ProviderResponse, RedactedCredential,
    };
    pub use crate::parser::{parse_json_object, recover, Recovered};
    pub use crate::service::{AiService, GenerateTextInput};
    pub use crate::telemetry;
}
