//! Kafka 配置归一化模块
//!
//! 把通用配置记录转换为与后端无关的已校验设置：
//! - 数值 / 时长字段为 0 时使用后端默认值
//! - 枚举字符串大小写不敏感，取值不在允许列表中直接拒绝
//! - 第一个非法字段即返回错误，不会启动任何后台任务或网络连接

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use conduit_config::{Backend, ConsumerConfig, ProducerConfig, SaslConfig};
use conduit_errors::{MessagingError, MessagingResult};
use secrecy::Secret;
use tracing::info;

use crate::backend;

/// 非同步提交且未指定间隔时的默认提交间隔
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(2);

/// 停止时等待后台任务退出的默认上限
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn positive_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn positive<T: PartialOrd + Default>(value: T) -> Option<T> {
    (value > T::default()).then_some(value)
}

/// 压缩类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }

    pub fn parse(value: &str) -> MessagingResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "snappy" => Ok(CompressionType::Snappy),
            "lz4" => Ok(CompressionType::Lz4),
            "zstd" => Ok(CompressionType::Zstd),
            _ => Err(MessagingError::unsupported("compression", value)),
        }
    }
}

/// 分区均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balancer {
    /// 写入字节最少的分区
    LeastBytes,
    /// Kafka murmur2 哈希
    Murmur2,
    /// IEEE CRC-32 哈希
    Crc32,
}

impl Balancer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Balancer::LeastBytes => "leastbytes",
            Balancer::Murmur2 => "murmur2",
            Balancer::Crc32 => "crc32",
        }
    }

    pub fn parse(value: &str) -> MessagingResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "leastbytes" => Ok(Balancer::LeastBytes),
            "murmur2" => Ok(Balancer::Murmur2),
            "crc32" => Ok(Balancer::Crc32),
            _ => Err(MessagingError::unsupported("balancer", value)),
        }
    }
}

/// SASL 认证机制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// `scram` 是 `scram_sha_256` 的别名
    pub fn parse(value: &str) -> MessagingResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "plain" => Ok(SaslMechanism::Plain),
            "scram" | "scram_sha_256" => Ok(SaslMechanism::ScramSha256),
            "scram_sha_512" => Ok(SaslMechanism::ScramSha512),
            _ => Err(MessagingError::unsupported("sasl.mechanism", value)),
        }
    }
}

/// SASL 凭据
#[derive(Debug, Clone)]
pub struct SaslCredentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: Secret<String>,
}

impl SaslCredentials {
    fn from_config(config: &SaslConfig) -> MessagingResult<Self> {
        let mechanism = SaslMechanism::parse(&config.mechanism)?;
        if config.username.is_empty() {
            return Err(MessagingError::config("sasl.username", "username is empty"));
        }
        Ok(Self {
            mechanism,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

/// 起始位点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOffset {
    /// 最早的保留记录
    Earliest,
    /// 最新记录
    Latest,
    /// 原样交给后端校验
    Native(String),
}

impl StartOffset {
    /// `first` / `last` 大小写不敏感；空串表示使用后端默认值
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }
        Some(match value.to_ascii_lowercase().as_str() {
            "first" => StartOffset::Earliest,
            "last" => StartOffset::Latest,
            _ => StartOffset::Native(value.to_string()),
        })
    }
}

/// 位点提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// 每条消息交付前同步提交
    Sync,
    /// 后台按间隔提交
    Interval(Duration),
}

/// 确认级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// 不等待确认
    None,
    /// leader 确认
    Leader,
    /// 全部同步副本确认
    All,
}

impl RequiredAcks {
    pub fn parse(value: i16) -> MessagingResult<Self> {
        match value {
            0 => Ok(RequiredAcks::None),
            1 => Ok(RequiredAcks::Leader),
            -1 => Ok(RequiredAcks::All),
            other => Err(MessagingError::config(
                "required_acks",
                format!("{other} is not one of -1, 0, 1"),
            )),
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            RequiredAcks::None => 0,
            RequiredAcks::Leader => 1,
            RequiredAcks::All => -1,
        }
    }
}

/// Broker 协议版本，形如 `2.8.1` 或 `0.10.2.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaVersion(Vec<u32>);

impl KafkaVersion {
    pub fn parse(value: &str) -> MessagingResult<Self> {
        let invalid = || MessagingError::config("version", format!("invalid kafka version `{value}`"));

        let parts = value
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<MessagingResult<Vec<_>>>()?;

        if !(2..=4).contains(&parts.len()) {
            return Err(invalid());
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

fn require_addresses(addresses: &[String]) -> MessagingResult<Vec<String>> {
    let addresses: Vec<String> = addresses
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    if addresses.is_empty() {
        return Err(MessagingError::config("addresses", "no broker address given"));
    }
    Ok(addresses)
}

fn parse_version(value: &str) -> MessagingResult<Option<KafkaVersion>> {
    if value.is_empty() {
        return Ok(None);
    }
    KafkaVersion::parse(value).map(Some)
}

/// 归一化后的 Consumer 设置
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub backend: Backend,
    pub addresses: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    pub start_offset: Option<StartOffset>,
    pub version: Option<KafkaVersion>,
    pub surface_errors: bool,
    pub min_bytes: Option<u32>,
    pub max_bytes: Option<u32>,
    pub commit: CommitMode,
    pub session_timeout: Option<Duration>,
    pub rebalance_timeout: Option<Duration>,
    /// 内部队列容量（至少为 1）
    pub queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub sasl: Option<SaslCredentials>,
}

impl ConsumerSettings {
    pub fn from_config(config: &ConsumerConfig) -> MessagingResult<Self> {
        let addresses = require_addresses(&config.addresses)?;

        if config.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(MessagingError::config("topics", "no topic given"));
        }
        if config.group_id.is_empty() {
            return Err(MessagingError::config("group_id", "group_id is empty"));
        }

        let version = parse_version(&config.version)?;
        let sasl = config
            .sasl
            .as_ref()
            .map(SaslCredentials::from_config)
            .transpose()?;

        let commit = if config.commit_sync {
            CommitMode::Sync
        } else {
            CommitMode::Interval(positive_ms(config.commit_interval_ms).unwrap_or(DEFAULT_COMMIT_INTERVAL))
        };

        let settings = Self {
            backend: config.backend,
            addresses,
            topics: config
                .topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            group_id: config.group_id.clone(),
            start_offset: StartOffset::parse(&config.start_offset),
            version,
            surface_errors: config.enable_errors,
            min_bytes: positive(config.min_bytes),
            max_bytes: positive(config.max_bytes),
            commit,
            session_timeout: positive_ms(config.session_timeout_ms),
            rebalance_timeout: positive_ms(config.rebalance_timeout_ms),
            queue_capacity: (config.worker_cnt as usize).max(1),
            shutdown_timeout: positive_ms(config.shutdown_timeout_ms).unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            sasl,
        };

        backend::validate_consumer(&settings)?;
        Ok(settings)
    }
}

/// 归一化后的 Producer 设置
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub backend: Backend,
    pub addresses: Vec<String>,
    /// 底层客户端自身的异步模式；启用批量分发时强制关闭
    pub async_mode: bool,
    pub compression: Option<CompressionType>,
    pub version: Option<KafkaVersion>,
    pub surface_async_errors: bool,
    pub buffer_size: Option<usize>,
    pub dial_timeout: Option<Duration>,
    pub balancer: Option<Balancer>,
    pub balancer_consistent: bool,
    /// 批量分发的并发上限
    pub dispatch_bound: Option<NonZeroUsize>,
    pub max_attempts: Option<u32>,
    pub required_acks: RequiredAcks,
    pub batch_size: Option<usize>,
    pub batch_bytes: Option<u64>,
    pub batch_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub sasl: Option<SaslCredentials>,
}

impl ProducerSettings {
    pub fn from_config(config: &ProducerConfig) -> MessagingResult<Self> {
        let addresses = require_addresses(&config.addresses)?;

        let compression = (!config.compression.is_empty())
            .then(|| CompressionType::parse(&config.compression))
            .transpose()?;
        let balancer = (!config.balancer.is_empty())
            .then(|| Balancer::parse(&config.balancer))
            .transpose()?;
        let sasl = config
            .sasl
            .as_ref()
            .map(SaslCredentials::from_config)
            .transpose()?;
        let required_acks = RequiredAcks::parse(config.required_acks)?;
        let version = parse_version(&config.version)?;

        let dispatch_bound = NonZeroUsize::new(config.batch_queue_size);
        let mut async_mode = config.async_mode;
        if let Some(bound) = dispatch_bound {
            if async_mode {
                info!(
                    batch_queue_size = bound.get(),
                    "Set transport async mode to false, because batch_queue_size > 0"
                );
                async_mode = false;
            } else {
                info!(
                    batch_queue_size = bound.get(),
                    "Sends become fire-and-forget, because batch_queue_size > 0"
                );
            }
        }

        let settings = Self {
            backend: config.backend,
            addresses,
            async_mode,
            compression,
            version,
            surface_async_errors: config.enable_async_errors,
            buffer_size: positive(config.buffer_size),
            dial_timeout: positive_ms(config.dial_timeout_ms),
            balancer,
            balancer_consistent: config.balancer_consistent,
            dispatch_bound,
            max_attempts: positive(config.max_attempts),
            required_acks,
            batch_size: positive(config.batch_size),
            batch_bytes: positive(config.batch_bytes),
            batch_timeout: positive_ms(config.batch_timeout_ms),
            read_timeout: positive_ms(config.read_timeout_ms),
            write_timeout: positive_ms(config.write_timeout_ms),
            shutdown_timeout: positive_ms(config.shutdown_timeout_ms).unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            sasl,
        };

        backend::validate_producer(&settings)?;
        Ok(settings)
    }

    /// 调用方视角下 send 是否不等待传输完成
    pub fn fire_and_forget(&self) -> bool {
        self.async_mode || self.dispatch_bound.is_some()
    }
}
