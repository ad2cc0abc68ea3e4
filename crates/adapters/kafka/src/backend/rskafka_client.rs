//! 纯 Rust 客户端（rskafka）后端
//!
//! rskafka 没有消费者组：位点只保存在内存中，从起始位点开始按分区轮询拉取。
//! 写入时由 [`Partitioner`] 在客户端选择分区。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conduit_errors::{MessagingError, MessagingResult};
use conduit_ports::Envelope;
use futures_util::future::join_all;
use rskafka::client::error::{Error as RsKafkaError, ProtocolError};
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder, SaslConfig};
use rskafka::record::Record;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{
    CommitMode, CompressionType, ConsumerSettings, ProducerSettings, RequiredAcks, SaslCredentials,
    SaslMechanism, StartOffset,
};
use crate::partitioner::Partitioner;
use crate::transport::{MessageReader, MessageWriter, ProducerRecord};

const DEFAULT_MAX_BYTES: i32 = 1024 * 1024;
const MAX_WAIT_MS: i32 = 500;

/// 起始位点解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPosition {
    At(OffsetAt),
    Exact(i64),
}

/// 单次 fetch 的字节范围，上界至少比下界大 1
fn fetch_range(min_bytes: i32, max_bytes: i32) -> Range<i32> {
    min_bytes..max_bytes.max(min_bytes.saturating_add(1))
}

fn start_position(offset: Option<&StartOffset>) -> MessagingResult<StartPosition> {
    match offset {
        None | Some(StartOffset::Latest) => Ok(StartPosition::At(OffsetAt::Latest)),
        Some(StartOffset::Earliest) => Ok(StartPosition::At(OffsetAt::Earliest)),
        Some(StartOffset::Native(value)) => match value.to_ascii_lowercase().as_str() {
            "earliest" => Ok(StartPosition::At(OffsetAt::Earliest)),
            "latest" => Ok(StartPosition::At(OffsetAt::Latest)),
            other => other
                .parse::<i64>()
                .ok()
                .filter(|offset| *offset >= 0)
                .map(StartPosition::Exact)
                .ok_or_else(|| {
                    MessagingError::config(
                        "start_offset",
                        format!("`{value}` is not earliest, latest or an offset"),
                    )
                }),
        },
    }
}

fn check_sasl(sasl: Option<&SaslCredentials>) -> MessagingResult<()> {
    match sasl {
        Some(sasl) if sasl.mechanism != SaslMechanism::Plain => Err(MessagingError::unsupported(
            "sasl.mechanism",
            sasl.mechanism.as_str(),
        )),
        _ => Ok(()),
    }
}

pub fn validate_consumer(settings: &ConsumerSettings) -> MessagingResult<()> {
    check_sasl(settings.sasl.as_ref())?;
    start_position(settings.start_offset.as_ref())?;
    Ok(())
}

pub fn validate_producer(settings: &ProducerSettings) -> MessagingResult<()> {
    check_sasl(settings.sasl.as_ref())
}

fn transport(context: &str, e: RsKafkaError) -> MessagingError {
    MessagingError::transport(format!("{context}: {e}"))
}

async fn build_client(
    addresses: &[String],
    sasl: Option<&SaslCredentials>,
    dial_timeout: Option<std::time::Duration>,
) -> MessagingResult<Client> {
    let mut builder = ClientBuilder::new(addresses.to_vec());
    if let Some(sasl) = sasl {
        builder = builder.sasl_config(SaslConfig::Plain {
            username: sasl.username.clone(),
            password: sasl.password.expose_secret().clone(),
        });
    }

    let build = builder.build();
    let client = match dial_timeout {
        Some(timeout) => tokio::time::timeout(timeout, build)
            .await
            .map_err(|_| MessagingError::transport("Timed out connecting to Kafka"))?,
        None => build.await,
    };
    client.map_err(|e| transport("Failed to create Kafka client", e))
}

/// topic 的全部分区 id（升序）
async fn topic_partitions(client: &Client, topic: &str) -> MessagingResult<Vec<i32>> {
    let topics = client
        .list_topics()
        .await
        .map_err(|e| transport("Failed to list topics", e))?;

    topics
        .into_iter()
        .find(|t| t.name == topic)
        .map(|t| t.partitions.into_iter().collect())
        .ok_or_else(|| MessagingError::transport(format!("Unknown topic `{topic}`")))
}

struct PartitionCursor {
    client: PartitionClient,
    topic: String,
    partition: i32,
    offset: i64,
}

/// 多分区轮询 reader
pub struct RskafkaReader {
    cursors: Vec<PartitionCursor>,
    next: usize,
    buffer: VecDeque<Envelope>,
    start: StartPosition,
    min_bytes: i32,
    max_bytes: i32,
    closed: bool,
}

impl RskafkaReader {
    pub async fn connect(settings: &ConsumerSettings) -> MessagingResult<Self> {
        let start = start_position(settings.start_offset.as_ref())?;
        if settings.commit == CommitMode::Sync {
            warn!("rskafka backend has no consumer groups, commit_sync is ignored");
        }

        let client = build_client(&settings.addresses, settings.sasl.as_ref(), None).await?;

        let mut cursors = Vec::new();
        for topic in &settings.topics {
            for partition in topic_partitions(&client, topic).await? {
                let partition_client = client
                    .partition_client(topic.clone(), partition, UnknownTopicHandling::Retry)
                    .await
                    .map_err(|e| transport("Failed to create partition client", e))?;

                let offset = match start {
                    StartPosition::Exact(offset) => offset,
                    StartPosition::At(at) => partition_client
                        .get_offset(at)
                        .await
                        .map_err(|e| transport("Failed to resolve start offset", e))?,
                };
                debug!(topic = %topic, partition, offset, "Partition cursor ready");

                cursors.push(PartitionCursor {
                    client: partition_client,
                    topic: topic.clone(),
                    partition,
                    offset,
                });
            }
        }

        info!(topics = ?settings.topics, partitions = cursors.len(), "rskafka reader connected");

        Ok(Self {
            cursors,
            next: 0,
            buffer: VecDeque::new(),
            start,
            min_bytes: settings.min_bytes.map_or(1, |b| b.min(i32::MAX as u32) as i32),
            max_bytes: settings
                .max_bytes
                .map_or(DEFAULT_MAX_BYTES, |b| b.min(i32::MAX as u32) as i32),
            closed: false,
        })
    }

    async fn fetch_next(&mut self) -> MessagingResult<()> {
        let index = self.next % self.cursors.len();
        self.next = index + 1;
        let cursor = &mut self.cursors[index];

        let range = fetch_range(self.min_bytes, self.max_bytes);
        let fetched = cursor
            .client
            .fetch_records(cursor.offset, range, MAX_WAIT_MS)
            .await;

        let records = match fetched {
            Ok((records, _high_watermark)) => records,
            Err(RsKafkaError::ServerError {
                protocol_error: ProtocolError::OffsetOutOfRange,
                ..
            }) => {
                let at = match self.start {
                    StartPosition::At(at) => at,
                    StartPosition::Exact(_) => OffsetAt::Earliest,
                };
                let reset = cursor
                    .client
                    .get_offset(at)
                    .await
                    .map_err(|e| transport("Failed to reset offset", e))?;
                warn!(
                    topic = %cursor.topic,
                    partition = cursor.partition,
                    old_offset = cursor.offset,
                    new_offset = reset,
                    "Offset out of range, resetting"
                );
                cursor.offset = reset;
                return Ok(());
            }
            Err(e) => return Err(transport("Failed to fetch records", e)),
        };

        for record in records {
            if record.offset < cursor.offset {
                continue;
            }
            cursor.offset = record.offset + 1;
            self.buffer.push_back(Envelope::new(
                cursor.topic.as_str(),
                cursor.partition,
                record.offset,
                record.record.value.unwrap_or_default(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageReader for RskafkaReader {
    async fn read(&mut self) -> MessagingResult<Envelope> {
        loop {
            if let Some(envelope) = self.buffer.pop_front() {
                return Ok(envelope);
            }
            if self.closed || self.cursors.is_empty() {
                return Err(MessagingError::Closed);
            }
            self.fetch_next().await?;
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
        self.cursors.clear();
    }
}

fn compression(codec: Option<CompressionType>) -> Compression {
    match codec {
        None | Some(CompressionType::None) => Compression::NoCompression,
        Some(CompressionType::Gzip) => Compression::Gzip,
        Some(CompressionType::Snappy) => Compression::Snappy,
        Some(CompressionType::Lz4) => Compression::Lz4,
        Some(CompressionType::Zstd) => Compression::Zstd,
    }
}

type TopicPartitions = Arc<Vec<(i32, Arc<PartitionClient>)>>;

/// 客户端分区的 writer
pub struct RskafkaWriter {
    client: Client,
    topics: Mutex<HashMap<String, TopicPartitions>>,
    partitioner: Partitioner,
    compression: Compression,
    async_mode: bool,
    surface_errors: bool,
    produces: TaskTracker,
}

impl RskafkaWriter {
    pub async fn connect(settings: &ProducerSettings) -> MessagingResult<Self> {
        if settings.required_acks != RequiredAcks::All {
            warn!(
                required_acks = settings.required_acks.as_i16(),
                "rskafka backend always waits for all in-sync replicas"
            );
        }

        let client =
            build_client(&settings.addresses, settings.sasl.as_ref(), settings.dial_timeout).await?;

        Ok(Self {
            client,
            topics: Mutex::new(HashMap::new()),
            partitioner: Partitioner::new(settings.balancer, settings.balancer_consistent),
            compression: compression(settings.compression),
            async_mode: settings.async_mode,
            surface_errors: settings.surface_async_errors,
            produces: TaskTracker::new(),
        })
    }

    async fn partitions(&self, topic: &str) -> MessagingResult<TopicPartitions> {
        let mut topics = self.topics.lock().await;
        if let Some(partitions) = topics.get(topic) {
            return Ok(Arc::clone(partitions));
        }

        let mut clients = Vec::new();
        for partition in topic_partitions(&self.client, topic).await? {
            let client = self
                .client
                .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
                .await
                .map_err(|e| transport("Failed to create partition client", e))?;
            clients.push((partition, Arc::new(client)));
        }
        if clients.is_empty() {
            return Err(MessagingError::transport(format!("Topic `{topic}` has no partitions")));
        }

        let partitions = Arc::new(clients);
        topics.insert(topic.to_string(), Arc::clone(&partitions));
        Ok(partitions)
    }
}

#[async_trait]
impl MessageWriter for RskafkaWriter {
    async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
        let mut batches: BTreeMap<(String, i32), (Arc<PartitionClient>, Vec<Record>)> =
            BTreeMap::new();

        for record in records {
            let partitions = self.partitions(&record.topic).await?;
            let index = self.partitioner.partition(
                &record.topic,
                record.key.as_deref(),
                record.size(),
                partitions.len(),
            );
            let (partition, client) = &partitions[index as usize];

            batches
                .entry((record.topic.to_string(), *partition))
                .or_insert_with(|| (Arc::clone(client), Vec::new()))
                .1
                .push(Record {
                    key: record.key.map(|k| k.into_owned()),
                    value: Some(record.value.into_owned()),
                    headers: BTreeMap::new(),
                    timestamp: Utc::now(),
                });
        }

        if self.async_mode {
            for ((topic, partition), (client, batch)) in batches {
                let compression = self.compression;
                let surface_errors = self.surface_errors;
                self.produces.spawn(async move {
                    if let Err(e) = client.produce(batch, compression).await {
                        if surface_errors {
                            error!(topic = %topic, partition, error = %e, "Async produce failed");
                        } else {
                            debug!(topic = %topic, partition, error = %e, "Async produce failed");
                        }
                    }
                });
            }
            return Ok(());
        }

        let produces = batches.into_iter().map(|((topic, partition), (client, batch))| async move {
            client
                .produce(batch, self.compression)
                .await
                .map(|offsets| debug!(topic = %topic, partition, ?offsets, "Records produced"))
                .map_err(|e| transport("Failed to produce records", e))
        });
        join_all(produces).await.into_iter().collect()
    }

    async fn close(&self) {
        self.produces.close();
        self.produces.wait().await;
        self.topics.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use conduit_config::{Backend, ConsumerConfig, ProducerConfig};

    use super::*;

    fn consumer_settings(start_offset: &str) -> MessagingResult<ConsumerSettings> {
        let config = ConsumerConfig::new(vec!["localhost:9092".into()], "g1")
            .with_topic("orders")
            .with_backend(Backend::Rskafka)
            .with_start_offset(start_offset);
        ConsumerSettings::from_config(&config)
    }

    #[test]
    fn test_start_position() {
        assert_eq!(start_position(None).unwrap(), StartPosition::At(OffsetAt::Latest));
        assert_eq!(
            start_position(Some(&StartOffset::Earliest)).unwrap(),
            StartPosition::At(OffsetAt::Earliest)
        );
        assert_eq!(
            start_position(Some(&StartOffset::Native("LATEST".into()))).unwrap(),
            StartPosition::At(OffsetAt::Latest)
        );
        assert_eq!(
            start_position(Some(&StartOffset::Native("42".into()))).unwrap(),
            StartPosition::Exact(42)
        );
    }

    #[test]
    fn test_native_offset_rejected_at_construction() {
        let err = consumer_settings("smallest").unwrap_err();
        assert_eq!(err.field(), Some("start_offset"));
        assert!(consumer_settings("-1").is_err());
        assert!(consumer_settings("first").is_ok());
    }

    #[test]
    fn test_only_plain_sasl() {
        let config = ProducerConfig::new(vec!["localhost:9092".into()])
            .with_backend(Backend::Rskafka)
            .with_sasl("scram_sha_512", "alice", "s3cret");
        let err = ProducerSettings::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            MessagingError::UnsupportedOption { field: "sasl.mechanism", .. }
        ));

        let config = ProducerConfig::new(vec!["localhost:9092".into()])
            .with_backend(Backend::Rskafka)
            .with_sasl("PLAIN", "alice", "s3cret");
        assert!(ProducerSettings::from_config(&config).is_ok());
    }

    #[test]
    fn test_fetch_range() {
        assert_eq!(fetch_range(1, DEFAULT_MAX_BYTES), 1..DEFAULT_MAX_BYTES);
        assert_eq!(fetch_range(4096, 1024), 4096..4097);
        assert_eq!(fetch_range(i32::MAX, i32::MAX), i32::MAX..i32::MAX);
    }

    #[test]
    fn test_compression_mapping() {
        assert!(matches!(compression(None), Compression::NoCompression));
        assert!(matches!(compression(Some(CompressionType::Zstd)), Compression::Zstd));
    }

    #[tokio::test]
    #[ignore] // 需要 Kafka 实例
    async fn test_rskafka_produce() {
        let config = ProducerConfig::new(vec!["localhost:9092".into()]).with_backend(Backend::Rskafka);
        let settings = ProducerSettings::from_config(&config).unwrap();
        let writer = RskafkaWriter::connect(&settings).await.unwrap();
        writer
            .write_messages(vec![ProducerRecord::borrowed("test_topic", Some(b"k"), b"hello")])
            .await
            .unwrap();
        writer.close().await;
    }
}
