//! 管道配置
//!
//! 所有字段都有默认值，YAML 中只需写要覆盖的部分：
//!
//! ```yaml
//! max_tokens_per_fragment: 1500
//! worker_pool_size: 16
//! retry_max_attempts: 5
//! summarize:
//!   requested_tokens: 256
//! ```

use crate::error::{ConfigError, Result};
use crate::llm::SummarizeOptions;
use crate::synthesis::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 管道运行时配置
///
/// 可以从 YAML 加载，也可以通过构建器链式设置，再传入 [`crate::pipeline::PipelineOrchestrator::new`]。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 单个片段的 token 上限
    pub max_tokens_per_fragment: usize,
    /// 并发 worker 数量；工作以外部调用为主，按调用延迟而非 CPU 核数设置
    pub worker_pool_size: usize,
    /// 首次调用失败后的最大重试次数（0 = 不重试）
    pub retry_max_attempts: u32,
    /// 重试初始等待（毫秒），指数退避翻倍
    pub retry_backoff_base_ms: u64,
    /// 单次等待上限（毫秒）
    pub retry_backoff_max_ms: u64,
    /// 记录在每条片段关联上的 agent 名称
    pub agent_name: String,
    /// 调用外部服务前是否先查已持久化的分片
    pub consult_store: bool,
    pub summarize: SummarizeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_fragment: 2000,
            worker_pool_size: 8,
            retry_max_attempts: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            agent_name: "kairix".to_string(),
            consult_store: true,
            summarize: SummarizeOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let config: PipelineConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens_per_fragment == 0 {
            return Err(invalid("max_tokens_per_fragment", "must be greater than 0"));
        }
        if self.worker_pool_size == 0 {
            return Err(invalid("worker_pool_size", "must be greater than 0"));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(invalid(
                "retry_backoff_max_ms",
                "must not be smaller than retry_backoff_base_ms",
            ));
        }
        if self.agent_name.trim().is_empty() {
            return Err(invalid("agent_name", "must not be empty"));
        }
        Ok(())
    }

    pub fn max_tokens_per_fragment(mut self, max_tokens: usize) -> Self {
        self.max_tokens_per_fragment = max_tokens;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn retry_max_attempts(mut self, retries: u32) -> Self {
        self.retry_max_attempts = retries;
        self
    }

    pub fn retry_backoff_base_ms(mut self, delay_ms: u64) -> Self {
        self.retry_backoff_base_ms = delay_ms;
        self
    }

    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn consult_store(mut self, enabled: bool) -> Self {
        self.consult_store = enabled;
        self
    }

    pub fn summarize(mut self, options: SummarizeOptions) -> Self {
        self.summarize = options;
        self
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_backoff_base())
            .with_max_backoff(Duration::from_millis(self.retry_backoff_max_ms))
    }
}

fn invalid(field: &str, message: &str) -> crate::error::SynthError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynthError;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_tokens_per_fragment, 2000);
        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.retry_backoff_base(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_tokens_per_fragment: 100\nworker_pool_size: 2\nsummarize:\n  requested_tokens: 64"
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_tokens_per_fragment, 100);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.summarize.requested_tokens, 64);
        assert_eq!(config.agent_name, "kairix");
        assert!(config.consult_store);
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = PipelineConfig::default()
            .max_tokens_per_fragment(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            SynthError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "max_tokens_per_fragment"
        ));
        assert!(PipelineConfig::default().worker_pool_size(0).validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, SynthError::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_pool_size: [not a number").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, SynthError::Config(ConfigError::ParseFailed(_))));
    }
}
