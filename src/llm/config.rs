//! 模型配置加载
//!
//! 从环境变量读取模型配置，格式：
//! ```text
//! KAIRIX_MODEL_<ID>_MODEL=gpt-4o-mini
//! KAIRIX_MODEL_<ID>_BASEURL=https://api.openai.com/v1/chat/completions
//! KAIRIX_MODEL_<ID>_APIKEY=sk-...
//! ```
//! `<ID>` 为 `SUMMARIZER` 或 `EMBEDDER`，不区分大小写。
//! 加载结果以值的形式传给各 provider，不做进程级缓存。

use crate::error::{ConfigError, Result, SynthError};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PREFIX: &str = "KAIRIX_MODEL_";

/// 单个模型的连接配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    /// 接口中使用的模型名（如 `gpt-4o-mini`）
    pub model: String,
    /// 接口完整 URL
    pub baseurl: String,
    pub apikey: String,
}

/// 已加载的模型配置表（key = 小写 ID）
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    pub models: HashMap<String, ModelConfig>,
}

impl ModelsConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut model_configs: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(PREFIX) else {
                continue;
            };
            let Some((model_id, config_key)) = suffix.rsplit_once('_') else {
                return Err(ConfigError::EnvFormat(key).into());
            };
            let config_key = config_key.to_lowercase();
            if !matches!(config_key.as_str(), "model" | "baseurl" | "apikey") || model_id.is_empty()
            {
                return Err(ConfigError::EnvFormat(key).into());
            }
            model_configs
                .entry(model_id.to_lowercase())
                .or_default()
                .insert(config_key, value);
        }

        let mut models = HashMap::new();
        for (model_id, mut config_map) in model_configs {
            let mut take = |field: &str| {
                config_map
                    .remove(field)
                    .ok_or_else(|| ConfigError::MissingField(format!("{model_id}.{field}")))
            };
            let config = ModelConfig {
                model: take("model")?,
                baseurl: take("baseurl")?,
                apikey: take("apikey")?,
            };
            models.insert(model_id, config);
        }
        Ok(Self { models })
    }

    pub fn get(&self, id: &str) -> Result<ModelConfig> {
        self.models
            .get(&id.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                SynthError::Config(ConfigError::MissingField(format!(
                    "{PREFIX}{}",
                    id.to_uppercase()
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_groups_by_id() {
        let config = ModelsConfig::from_vars(vars(&[
            ("KAIRIX_MODEL_SUMMARIZER_MODEL", "gpt-4o-mini"),
            ("KAIRIX_MODEL_SUMMARIZER_BASEURL", "http://localhost/v1/chat/completions"),
            ("KAIRIX_MODEL_SUMMARIZER_APIKEY", "sk-test"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        let model = config.get("summarizer").unwrap();
        assert_eq!(model.model, "gpt-4o-mini");
        assert!(config.get("embedder").is_err());
    }

    #[test]
    fn test_missing_field_reported() {
        let err =
            ModelsConfig::from_vars(vars(&[("KAIRIX_MODEL_EMBEDDER_MODEL", "m")])).unwrap_err();
        assert!(matches!(
            err,
            SynthError::Config(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err =
            ModelsConfig::from_vars(vars(&[("KAIRIX_MODEL_EMBEDDER_TIMEOUT", "3")])).unwrap_err();
        assert!(matches!(err, SynthError::Config(ConfigError::EnvFormat(_))));
    }
}
