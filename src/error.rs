use std::fmt;

/// 记忆合成管道的统一错误类型
#[derive(Debug)]
pub enum SynthError {
    /// 对话结构校验失败
    Validation(ValidationError),
    /// 分片失败
    Chunking(ChunkingError),
    /// 外部摘要 / 向量服务错误
    Provider(ProviderError),
    /// 图存储错误
    Persistence(PersistenceError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// 对话结构错误，对整条对话致命，其余对话继续处理
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// 对话 ID 为空
    EmptyConversationId,
    /// 对话缺少标题
    MissingTitle,
    /// 消息缺少角色
    MissingRole { sequence: usize },
    /// 消息序号未严格递增
    OutOfOrder { previous: usize, found: usize },
    /// 消息时间戳倒退
    TimestampRegression { sequence: usize },
}

/// 分片错误，只对单个分片致命
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkingError {
    /// 按字符切到最小仍超出预算
    Unsplittable {
        sequence: usize,
        tokens: usize,
        max_tokens: usize,
    },
}

/// 外部服务错误：瞬时错误可重试，致命错误不可重试
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// 超时、限流、5xx
    Transient { provider: String, message: String },
    /// 非法输入、永久拒绝
    Fatal { provider: String, message: String },
}

/// 图存储错误
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// 存储暂不可用
    Unavailable(String),
    /// 读写失败
    Io(String),
    /// 序列化失败
    Serialization(String),
    /// 存储拒绝写入（数据本身有问题，不重试）
    Rejected(String),
}

/// 配置错误
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 缺少必需的配置项
    MissingField(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
    /// 环境变量格式错误
    EnvFormat(String),
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn fatal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Fatal {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// 按 HTTP 状态码归类：408 / 429 / 5xx 视为瞬时错误
    pub fn from_status(provider: &str, status: u16, message: impl Into<String>) -> Self {
        let message = format!("status {}: {}", status, message.into());
        if status == 408 || status == 429 || (500..600).contains(&status) {
            ProviderError::transient(provider, message)
        } else {
            ProviderError::fatal(provider, message)
        }
    }

    /// 按传输层错误归类：超时与连接失败视为瞬时错误
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::transient(provider, "Request timeout")
        } else if err.is_connect() {
            ProviderError::transient(provider, format!("Connection failed: {}", err))
        } else if let Some(status) = err.status() {
            ProviderError::from_status(provider, status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ProviderError::fatal(provider, format!("Invalid response: {}", err))
        } else {
            ProviderError::transient(provider, err.to_string())
        }
    }
}

impl PersistenceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, PersistenceError::Rejected(_))
    }
}

// 实现 Display trait
impl fmt::Display for SynthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthError::Validation(e) => write!(f, "Validation Error: {}", e),
            SynthError::Chunking(e) => write!(f, "Chunking Error: {}", e),
            SynthError::Provider(e) => write!(f, "Provider Error: {}", e),
            SynthError::Persistence(e) => write!(f, "Persistence Error: {}", e),
            SynthError::Config(e) => write!(f, "Config Error: {}", e),
            SynthError::Io(e) => write!(f, "IO Error: {}", e),
            SynthError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyConversationId => write!(f, "Conversation id is empty"),
            ValidationError::MissingTitle => write!(f, "Conversation has no title"),
            ValidationError::MissingRole { sequence } => {
                write!(f, "Message {} has no role", sequence)
            }
            ValidationError::OutOfOrder { previous, found } => write!(
                f,
                "Message sequence out of order: {} follows {}",
                found, previous
            ),
            ValidationError::TimestampRegression { sequence } => {
                write!(f, "Message {} is older than its predecessor", sequence)
            }
        }
    }
}

impl fmt::Display for ChunkingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkingError::Unsplittable {
                sequence,
                tokens,
                max_tokens,
            } => write!(
                f,
                "Message {} cannot be split under {} tokens (smallest piece: {})",
                sequence, max_tokens, tokens
            ),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient { provider, message } => {
                write!(f, "{} transient failure: {}", provider, message)
            }
            ProviderError::Fatal { provider, message } => {
                write!(f, "{} fatal failure: {}", provider, message)
            }
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            PersistenceError::Io(msg) => write!(f, "Store IO failure: {}", msg),
            PersistenceError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            PersistenceError::Rejected(msg) => write!(f, "Write rejected: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::MissingField(field) => write!(f, "Missing config field: {}", field),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
            ConfigError::EnvFormat(key) => write!(f, "Malformed environment variable: {}", key),
        }
    }
}

// 实现 std::error::Error trait
impl std::error::Error for SynthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SynthError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ValidationError {}
impl std::error::Error for ChunkingError {}
impl std::error::Error for ProviderError {}
impl std::error::Error for PersistenceError {}
impl std::error::Error for ConfigError {}

// From 转换实现
impl From<std::io::Error> for SynthError {
    fn from(err: std::io::Error) -> Self {
        SynthError::Io(err)
    }
}

impl From<serde_json::Error> for SynthError {
    fn from(err: serde_json::Error) -> Self {
        SynthError::Other(format!("JSON parse error: {}", err))
    }
}

impl From<serde_yaml::Error> for SynthError {
    fn from(err: serde_yaml::Error) -> Self {
        SynthError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<reqwest::Error> for SynthError {
    fn from(err: reqwest::Error) -> Self {
        SynthError::Provider(ProviderError::from_reqwest("http", err))
    }
}

impl From<ValidationError> for SynthError {
    fn from(err: ValidationError) -> Self {
        SynthError::Validation(err)
    }
}

impl From<ChunkingError> for SynthError {
    fn from(err: ChunkingError) -> Self {
        SynthError::Chunking(err)
    }
}

impl From<ProviderError> for SynthError {
    fn from(err: ProviderError) -> Self {
        SynthError::Provider(err)
    }
}

impl From<PersistenceError> for SynthError {
    fn from(err: PersistenceError) -> Self {
        SynthError::Persistence(err)
    }
}

impl From<ConfigError> for SynthError {
    fn from(err: ConfigError) -> Self {
        SynthError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, SynthError>;
