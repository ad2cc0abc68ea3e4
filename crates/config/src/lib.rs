//! conduit-config - 配置加载库
//!
//! 通用的 Producer / Consumer 配置记录。字段与后端无关，
//! 由适配器在构造时归一化为具体后端的设置。
//!
//! 加载顺序（后者覆盖前者）：默认值 → TOML 文件 → 环境变量 → 命令行覆盖项

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::Secret;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),
}

/// 底层客户端实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// librdkafka（消费者组、broker 端提交）
    #[default]
    Rdkafka,
    /// 纯 Rust 客户端（分区直连，位点保存在内存）
    Rskafka,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Rdkafka => "rdkafka",
            Backend::Rskafka => "rskafka",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rdkafka" => Ok(Backend::Rdkafka),
            "rskafka" => Ok(Backend::Rskafka),
            other => Err(format!("unknown backend `{other}`, expected rdkafka|rskafka")),
        }
    }
}

impl<'de> Deserialize<'de> for Backend {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// SASL 配置
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    /// plain | scram | scram_sha_256 | scram_sha_512
    pub mechanism: String,
    pub username: String,
    pub password: Secret<String>,
}

/// Consumer 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub backend: Backend,
    /// 内部队列容量，0 视为 1
    pub worker_cnt: u32,
    pub addresses: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    /// first | last | 后端原生取值
    pub start_offset: String,
    /// broker 协议版本，如 "2.8.1"
    pub version: String,
    /// 是否以 error 级别输出客户端异步上报的错误
    pub enable_errors: bool,
    pub min_bytes: u32,
    pub max_bytes: u32,
    pub commit_sync: bool,
    pub commit_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub rebalance_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub sasl: Option<SaslConfig>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            worker_cnt: 0,
            addresses: Vec::new(),
            topics: Vec::new(),
            group_id: String::new(),
            start_offset: String::new(),
            version: String::new(),
            enable_errors: false,
            min_bytes: 0,
            max_bytes: 0,
            commit_sync: false,
            commit_interval_ms: 0,
            session_timeout_ms: 0,
            rebalance_timeout_ms: 0,
            shutdown_timeout_ms: 0,
            sasl: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new(addresses: Vec<String>, group_id: impl Into<String>) -> Self {
        Self {
            addresses,
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_start_offset(mut self, offset: impl Into<String>) -> Self {
        self.start_offset = offset.into();
        self
    }
}

/// Producer 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub backend: Backend,
    pub addresses: Vec<String>,
    #[serde(rename = "async")]
    pub async_mode: bool,
    /// none | gzip | snappy | lz4 | zstd
    pub compression: String,
    pub version: String,
    pub enable_async_errors: bool,
    pub buffer_size: usize,
    pub dial_timeout_ms: u64,
    /// leastbytes | murmur2 | crc32
    pub balancer: String,
    pub balancer_consistent: bool,
    /// 并发写入上限，0 表示不启用批量分发
    pub batch_queue_size: usize,
    pub max_attempts: u32,
    /// -1 全部副本，0 不等待，1 leader
    pub required_acks: i16,
    pub batch_size: usize,
    pub batch_bytes: u64,
    pub batch_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub sasl: Option<SaslConfig>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            addresses: Vec::new(),
            async_mode: false,
            compression: String::new(),
            version: String::new(),
            enable_async_errors: false,
            buffer_size: 0,
            dial_timeout_ms: 0,
            balancer: String::new(),
            balancer_consistent: false,
            batch_queue_size: 0,
            max_attempts: 0,
            required_acks: 0,
            batch_size: 0,
            batch_bytes: 0,
            batch_timeout_ms: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            shutdown_timeout_ms: 0,
            sasl: None,
        }
    }
}

impl ProducerConfig {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_async(mut self, enable: bool) -> Self {
        self.async_mode = enable;
        self
    }

    pub fn with_compression(mut self, codec: impl Into<String>) -> Self {
        self.compression = codec.into();
        self
    }

    pub fn with_balancer(mut self, balancer: impl Into<String>, consistent: bool) -> Self {
        self.balancer = balancer.into();
        self.balancer_consistent = consistent;
        self
    }

    pub fn with_batch_queue_size(mut self, size: usize) -> Self {
        self.batch_queue_size = size;
        self
    }

    pub fn with_required_acks(mut self, acks: i16) -> Self {
        self.required_acks = acks;
        self
    }

    pub fn with_sasl(
        mut self,
        mechanism: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.sasl = Some(SaslConfig {
            mechanism: mechanism.into(),
            username: username.into(),
            password: Secret::new(password.into()),
        });
        self
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// 环境变量前缀，嵌套字段用 `__` 分隔，例如 `KAFKA_CLI_SASL__USERNAME`
pub const DEFAULT_ENV_PREFIX: &str = "KAFKA_CLI_";

/// 配置加载器
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { file: None }
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }

    fn figment<D: Serialize, O: Serialize>(&self, defaults: &D, overrides: &O) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(defaults));
        if let Some(file) = &self.file {
            figment = figment.merge(Toml::file(file));
        }
        figment
            .merge(Env::prefixed(DEFAULT_ENV_PREFIX).split("__"))
            .merge(Serialized::globals(overrides))
    }

    /// 加载配置
    ///
    /// `defaults` 与 `overrides` 只需包含需要设置的字段；`overrides` 中为 `None`
    /// 的字段应使用 `skip_serializing_if` 跳过，否则会覆盖文件与环境变量中的值。
    pub fn load<T, D, O>(&self, defaults: &D, overrides: &O) -> Result<T, ConfigError>
    where
        T: DeserializeOwned,
        D: Serialize,
        O: Serialize,
    {
        Ok(self.figment(defaults, overrides).extract()?)
    }

    /// 加载遥测配置（与业务配置共用同一组来源）
    pub fn load_telemetry<O: Serialize>(&self, overrides: &O) -> Result<TelemetryConfig, ConfigError> {
        self.load(&TelemetryConfig::default_layer(), overrides)
    }
}

impl TelemetryConfig {
    fn default_layer() -> impl Serialize {
        #[derive(Serialize)]
        struct Layer {
            log_level: &'static str,
        }
        Layer { log_level: "info" }
    }
}
