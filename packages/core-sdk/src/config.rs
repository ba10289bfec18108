use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::ProviderKind;

const DEFAULT_CONFIG_FILE: &str = "complyai.toml";

/**
 * \brief 单个模型服务的连接参数。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    /** \brief API 基地址，不含版本路径 */
    pub api_base: String,
    /** \brief 默认模型名 */
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub gemini: ProviderSettings,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderSettings {
                api_base: "https://api.openai.com".to_string(),
                model: "gpt-4o-mini".to_string(),
            },
            anthropic: ProviderSettings {
                api_base: "https://api.anthropic.com".to_string(),
                model: "claude-3-5-haiku-latest".to_string(),
            },
            gemini: ProviderSettings {
                api_base: "https://generativelanguage.googleapis.com".to_string(),
                model: "gemini-1.5-flash".to_string(),
            },
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }

    fn get_mut(&mut self, kind: ProviderKind) -> &mut ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::Anthropic => &mut self.anthropic,
            ProviderKind::Gemini => &mut self.gemini,
        }
    }
}

/**
 * \brief 进程级配置：可选 TOML 文件 + 环境变量覆盖。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /** \brief 单次调用的截止时间（秒） */
    pub request_timeout_secs: u64,
    /** \brief 全局回退优先级 */
    pub priority: Vec<ProviderKind>,
    pub providers: ProvidersConfig,
    /** \brief 每个服务的并发上限，None 表示不限制 */
    pub max_concurrent_per_provider: Option<usize>,
    pub default_temperature: f64,
    pub default_max_tokens: u32,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("complyai.db"),
            request_timeout_secs: 30,
            priority: ProviderKind::ALL.to_vec(),
            providers: ProvidersConfig::default(),
            max_concurrent_per_provider: None,
            default_temperature: 0.7,
            default_max_tokens: 2048,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl AppConfig {
    /**
     * \brief 读取配置。
     * \param path 显式指定的文件；为 None 时尝试当前目录下的 complyai.toml。
     */
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        let env: HashMap<String, String> = std::env::vars().collect();
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {} failed", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {} failed", path.display()))
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = env.get("COMPLYAI_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("COMPLYAI_TIMEOUT_SECS") {
            self.request_timeout_secs = v
                .parse()
                .with_context(|| format!("COMPLYAI_TIMEOUT_SECS is not a number: {}", v))?;
        }
        if let Some(v) = env.get("COMPLYAI_PRIORITY") {
            self.priority = parse_priority(v)?;
        }
        if let Some(v) = env.get("COMPLYAI_LOG_LEVEL") {
            self.log_level = v.clone();
        }
        for kind in ProviderKind::ALL {
            let prefix = format!("COMPLYAI_{}", kind.as_str().to_ascii_uppercase());
            if let Some(v) = env.get(&format!("{}_BASE", prefix)) {
                self.providers.get_mut(kind).api_base = v.clone();
            }
            if let Some(v) = env.get(&format!("{}_MODEL", prefix)) {
                self.providers.get_mut(kind).model = v.clone();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if self.priority.is_empty() {
            bail!("priority list must name at least one provider");
        }
        if self.max_concurrent_per_provider == Some(0) {
            bail!("max_concurrent_per_provider must be greater than zero when set");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_priority(raw: &str) -> Result<Vec<ProviderKind>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: ProviderKind = part.parse().map_err(anyhow::Error::msg)?;
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    Ok(out)
}

/**
 * \brief 启动时从进程环境读取的密钥，每个服务至多一个。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderSecrets {
    entries: Vec<(ProviderKind, String)>,
}

impl ProviderSecrets {
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let entries = ProviderKind::ALL
            .into_iter()
            .filter_map(|kind| {
                env.get(kind.env_key())
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(|v| (kind, v.to_string()))
            })
            .collect();
        Self { entries }
    }

    pub fn with(mut self, kind: ProviderKind, secret: &str) -> Self {
        self.entries.retain(|(k, _)| *k != kind);
        self.entries.push((kind, secret.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProviderKind, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
