//! librdkafka 后端

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_errors::{MessagingError, MessagingResult};
use conduit_ports::Envelope;
use futures_util::future::join_all;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode as RdCommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use secrecy::ExposeSecret;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{
    Balancer, CommitMode, ConsumerSettings, ProducerSettings, SaslCredentials, StartOffset,
};
use crate::transport::{MessageReader, MessageWriter, ProducerRecord};

/// 元数据探测、本地队列等待等操作的默认超时
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// 把 librdkafka 的日志和异步错误转发到 tracing
#[derive(Debug, Clone, Copy)]
pub struct ClientLogContext {
    surface_errors: bool,
}

impl ClientLogContext {
    pub fn new(surface_errors: bool) -> Self {
        Self { surface_errors }
    }
}

impl ClientContext for ClientLogContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info | RDKafkaLogLevel::Debug => {
                debug!(facility = fac, "{}", log_message)
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        if self.surface_errors {
            error!(error = %error, reason, "Kafka client error");
        } else {
            debug!(error = %error, reason, "Kafka client error");
        }
    }
}

impl ConsumerContext for ClientLogContext {}

fn push(entries: &mut Vec<(String, String)>, key: &str, value: impl ToString) {
    entries.push((key.to_string(), value.to_string()));
}

fn common_entries(addresses: &[String], sasl: Option<&SaslCredentials>) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    push(&mut entries, "bootstrap.servers", addresses.join(","));

    if let Some(sasl) = sasl {
        push(&mut entries, "security.protocol", "SASL_PLAINTEXT");
        push(&mut entries, "sasl.mechanism", sasl.mechanism.as_str());
        push(&mut entries, "sasl.username", &sasl.username);
        push(&mut entries, "sasl.password", sasl.password.expose_secret());
    }
    entries
}

/// Consumer 设置 → librdkafka 配置项
pub fn consumer_entries(settings: &ConsumerSettings) -> Vec<(String, String)> {
    let mut entries = common_entries(&settings.addresses, settings.sasl.as_ref());
    push(&mut entries, "group.id", &settings.group_id);

    match settings.commit {
        CommitMode::Sync => push(&mut entries, "enable.auto.commit", "false"),
        CommitMode::Interval(interval) => {
            push(&mut entries, "enable.auto.commit", "true");
            push(&mut entries, "auto.commit.interval.ms", interval.as_millis());
        }
    }

    if let Some(offset) = &settings.start_offset {
        let value = match offset {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest => "latest",
            StartOffset::Native(value) => value.as_str(),
        };
        push(&mut entries, "auto.offset.reset", value);
    }
    if let Some(min_bytes) = settings.min_bytes {
        push(&mut entries, "fetch.min.bytes", min_bytes);
    }
    if let Some(max_bytes) = settings.max_bytes {
        push(&mut entries, "fetch.max.bytes", max_bytes);
    }
    if let Some(timeout) = settings.session_timeout {
        push(&mut entries, "session.timeout.ms", timeout.as_millis());
    }
    if let Some(timeout) = settings.rebalance_timeout {
        push(&mut entries, "max.poll.interval.ms", timeout.as_millis());
    }
    if let Some(version) = &settings.version {
        push(&mut entries, "broker.version.fallback", version);
    }
    entries
}

/// Producer 设置 → librdkafka 配置项
pub fn producer_entries(settings: &ProducerSettings) -> Vec<(String, String)> {
    let mut entries = common_entries(&settings.addresses, settings.sasl.as_ref());

    if let Some(compression) = settings.compression {
        push(&mut entries, "compression.type", compression.as_str());
    }
    if let Some(balancer) = settings.balancer {
        let partitioner = match (balancer, settings.balancer_consistent) {
            (Balancer::Crc32, true) => "consistent",
            (Balancer::Crc32, false) => "consistent_random",
            (Balancer::Murmur2, true) => "murmur2",
            (Balancer::Murmur2, false) => "murmur2_random",
            (Balancer::LeastBytes, _) => "random",
        };
        push(&mut entries, "partitioner", partitioner);
    }
    if let Some(size) = settings.batch_size {
        push(&mut entries, "batch.num.messages", size);
    }
    if let Some(bytes) = settings.batch_bytes {
        push(&mut entries, "batch.size", bytes);
    }
    if let Some(linger) = settings.batch_timeout {
        push(&mut entries, "linger.ms", linger.as_millis());
    }
    push(&mut entries, "acks", settings.required_acks.as_i16());
    if let Some(attempts) = settings.max_attempts {
        push(&mut entries, "retries", attempts.saturating_sub(1));
    }
    if let Some(timeout) = settings.read_timeout {
        push(&mut entries, "socket.timeout.ms", timeout.as_millis());
    }
    if let Some(timeout) = settings.write_timeout {
        push(&mut entries, "message.timeout.ms", timeout.as_millis());
    }
    if let Some(timeout) = settings.dial_timeout {
        push(&mut entries, "socket.connection.setup.timeout.ms", timeout.as_millis());
    }
    if let Some(size) = settings.buffer_size {
        push(&mut entries, "queue.buffering.max.messages", size);
    }
    if let Some(version) = &settings.version {
        push(&mut entries, "broker.version.fallback", version);
    }
    entries
}

fn client_config(entries: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in entries {
        config.set(key, value);
    }
    config
}

fn map_create_error(e: KafkaError) -> MessagingError {
    match e {
        KafkaError::ClientConfig(_, desc, key, value) => {
            let field = match key.as_str() {
                "auto.offset.reset" => "start_offset",
                _ => "client",
            };
            MessagingError::config(field, format!("{key}={value}: {desc}"))
        }
        other => MessagingError::transport(format!("Failed to create Kafka client: {other}")),
    }
}

fn join_error(e: tokio::task::JoinError) -> MessagingError {
    MessagingError::transport(format!("Kafka client task failed: {e}"))
}

/// 提交位点：下一条待消费的 offset
fn commit_list(topic: &str, partition: i32, offset: i64) -> MessagingResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
    .map_err(|e| MessagingError::transport(format!("Invalid commit offset: {e}")))?;
    Ok(list)
}

/// 基于 `StreamConsumer` 的 reader
pub struct RdkafkaReader {
    consumer: Option<Arc<StreamConsumer<ClientLogContext>>>,
    commit_sync: bool,
}

impl RdkafkaReader {
    /// 创建 consumer、探测 broker 元数据并订阅 topics
    pub async fn connect(settings: &ConsumerSettings) -> MessagingResult<Self> {
        let config = client_config(consumer_entries(settings));
        let context = ClientLogContext::new(settings.surface_errors);
        let topics = settings.topics.clone();

        let consumer = tokio::task::spawn_blocking(move || {
            let consumer: StreamConsumer<ClientLogContext> =
                config.create_with_context(context).map_err(map_create_error)?;

            consumer
                .fetch_metadata(None, DEFAULT_CLIENT_TIMEOUT)
                .map_err(|e| MessagingError::transport(format!("Failed to reach brokers: {e}")))?;

            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topics)
                .map_err(|e| MessagingError::transport(format!("Failed to subscribe to topics: {e}")))?;

            Ok::<_, MessagingError>(consumer)
        })
        .await
        .map_err(join_error)??;

        info!(group_id = %settings.group_id, topics = ?settings.topics, "Subscribed to Kafka topics");

        Ok(Self {
            consumer: Some(Arc::new(consumer)),
            commit_sync: settings.commit == CommitMode::Sync,
        })
    }
}

#[async_trait]
impl MessageReader for RdkafkaReader {
    async fn read(&mut self) -> MessagingResult<Envelope> {
        let consumer = self.consumer.as_ref().ok_or(MessagingError::Closed)?;

        let message = consumer
            .recv()
            .await
            .map_err(|e| MessagingError::transport(format!("Failed to receive message: {e}")))?;

        Ok(Envelope::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.payload().unwrap_or_default(),
        ))
    }

    /// 同步提交模式下阻塞提交到 broker；间隔模式由 librdkafka 自动提交
    async fn commit(&mut self, topic: &str, partition: i32, offset: i64) -> MessagingResult<()> {
        if !self.commit_sync {
            return Ok(());
        }
        let consumer = Arc::clone(self.consumer.as_ref().ok_or(MessagingError::Closed)?);
        let list = commit_list(topic, partition, offset)?;

        tokio::task::spawn_blocking(move || consumer.commit(&list, RdCommitMode::Sync))
            .await
            .map_err(join_error)?
            .map_err(|e| MessagingError::transport(format!("Failed to commit offset: {e}")))
    }

    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        let closed = tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();
            drop(consumer);
        })
        .await;
        if let Err(e) = closed {
            error!(error = %e, "Failed to close Kafka consumer");
        }
    }
}

/// 基于 `FutureProducer` 的 writer
pub struct RdkafkaWriter {
    producer: FutureProducer<ClientLogContext>,
    async_mode: bool,
    surface_errors: bool,
    queue_timeout: Duration,
    deliveries: TaskTracker,
}

impl RdkafkaWriter {
    pub async fn connect(settings: &ProducerSettings) -> MessagingResult<Self> {
        let config = client_config(producer_entries(settings));
        let context = ClientLogContext::new(settings.surface_async_errors);
        let probe_timeout = settings.dial_timeout.unwrap_or(DEFAULT_CLIENT_TIMEOUT);

        let producer = tokio::task::spawn_blocking(move || {
            let producer: FutureProducer<ClientLogContext> =
                config.create_with_context(context).map_err(map_create_error)?;

            producer
                .client()
                .fetch_metadata(None, probe_timeout)
                .map_err(|e| MessagingError::transport(format!("Failed to reach brokers: {e}")))?;

            Ok::<_, MessagingError>(producer)
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            producer,
            async_mode: settings.async_mode,
            surface_errors: settings.surface_async_errors,
            queue_timeout: settings.write_timeout.unwrap_or(DEFAULT_CLIENT_TIMEOUT),
            deliveries: TaskTracker::new(),
        })
    }

    async fn send_sync(&self, record: &ProducerRecord<'_>) -> MessagingResult<()> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(record.value.as_ref());
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_ref());
        }

        self.producer
            .send(future_record, Timeout::After(self.queue_timeout))
            .await
            .map_err(|(e, _)| MessagingError::transport(format!("Failed to send message: {e}")))?;
        Ok(())
    }

    fn send_async(&self, record: &ProducerRecord<'_>) -> MessagingResult<()> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(record.value.as_ref());
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_ref());
        }

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| MessagingError::transport(format!("Failed to enqueue message: {e}")))?;

        let topic = record.topic.to_string();
        let surface_errors = self.surface_errors;
        self.deliveries.spawn(async move {
            let failure = match delivery.await {
                Ok(Ok(_)) => None,
                Ok(Err((e, _))) => Some(e.to_string()),
                Err(_) => Some("delivery report dropped".to_string()),
            };
            if let Some(reason) = failure {
                if surface_errors {
                    error!(topic = %topic, error = %reason, "Async delivery failed");
                } else {
                    debug!(topic = %topic, error = %reason, "Async delivery failed");
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl MessageWriter for RdkafkaWriter {
    async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
        if self.async_mode {
            for record in &records {
                self.send_async(record)?;
            }
            return Ok(());
        }

        let results = join_all(records.iter().map(|record| self.send_sync(record))).await;
        results.into_iter().collect()
    }

    async fn close(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;

        let producer = self.producer.clone();
        let timeout = self.queue_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => debug!("Kafka producer flushed"),
            Ok(Err(e)) => warn!(error = %e, "Failed to flush Kafka producer"),
            Err(e) => error!(error = %e, "Kafka producer flush task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use conduit_config::{ConsumerConfig, ProducerConfig};

    use super::*;

    fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_consumer_entries() {
        let mut config = ConsumerConfig::new(vec!["b1:9092".into(), "b2:9092".into()], "g1")
            .with_topic("orders")
            .with_start_offset("first");
        config.version = "2.8.0".into();
        config.rebalance_timeout_ms = 60_000;
        let settings = ConsumerSettings::from_config(&config).unwrap();
        let entries = consumer_entries(&settings);

        assert_eq!(lookup(&entries, "bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(lookup(&entries, "group.id"), Some("g1"));
        assert_eq!(lookup(&entries, "auto.offset.reset"), Some("earliest"));
        assert_eq!(lookup(&entries, "enable.auto.commit"), Some("true"));
        assert_eq!(lookup(&entries, "auto.commit.interval.ms"), Some("2000"));
        assert_eq!(lookup(&entries, "max.poll.interval.ms"), Some("60000"));
        assert_eq!(lookup(&entries, "broker.version.fallback"), Some("2.8.0"));
        assert_eq!(lookup(&entries, "fetch.min.bytes"), None);
        assert_eq!(lookup(&entries, "security.protocol"), None);
    }

    #[test]
    fn test_consumer_sync_commit_and_native_offset() {
        let mut config = ConsumerConfig::new(vec!["b1:9092".into()], "g1")
            .with_topic("orders")
            .with_start_offset("smallest");
        config.commit_sync = true;
        let settings = ConsumerSettings::from_config(&config).unwrap();
        let entries = consumer_entries(&settings);

        assert_eq!(lookup(&entries, "enable.auto.commit"), Some("false"));
        assert_eq!(lookup(&entries, "auto.commit.interval.ms"), None);
        assert_eq!(lookup(&entries, "auto.offset.reset"), Some("smallest"));
    }

    #[test]
    fn test_producer_entries() {
        let mut config = ProducerConfig::new(vec!["b1:9092".into()])
            .with_compression("LZ4")
            .with_balancer("crc32", false)
            .with_required_acks(-1)
            .with_sasl("scram", "alice", "s3cret");
        config.max_attempts = 3;
        config.batch_timeout_ms = 5;
        let settings = ProducerSettings::from_config(&config).unwrap();
        let entries = producer_entries(&settings);

        assert_eq!(lookup(&entries, "compression.type"), Some("lz4"));
        assert_eq!(lookup(&entries, "partitioner"), Some("consistent_random"));
        assert_eq!(lookup(&entries, "acks"), Some("-1"));
        assert_eq!(lookup(&entries, "retries"), Some("2"));
        assert_eq!(lookup(&entries, "linger.ms"), Some("5"));
        assert_eq!(lookup(&entries, "security.protocol"), Some("SASL_PLAINTEXT"));
        assert_eq!(lookup(&entries, "sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(lookup(&entries, "sasl.password"), Some("s3cret"));
    }

    #[test]
    fn test_partitioner_mapping() {
        let cases = [
            ("crc32", true, "consistent"),
            ("murmur2", true, "murmur2"),
            ("murmur2", false, "murmur2_random"),
            ("leastbytes", false, "random"),
        ];
        for (balancer, consistent, expected) in cases {
            let config = ProducerConfig::new(vec!["b1:9092".into()]).with_balancer(balancer, consistent);
            let settings = ProducerSettings::from_config(&config).unwrap();
            assert_eq!(lookup(&producer_entries(&settings), "partitioner"), Some(expected));
        }
    }

    #[test]
    fn test_create_error_mapping() {
        let err = map_create_error(KafkaError::ClientConfig(
            rdkafka::types::RDKafkaConfRes::RD_KAFKA_CONF_INVALID,
            "Invalid value".into(),
            "auto.offset.reset".into(),
            "sideways".into(),
        ));
        assert_eq!(err.field(), Some("start_offset"));
    }

    #[test]
    fn test_commit_list_points_past_the_message() {
        let list = commit_list("orders", 3, 41).unwrap();

        let element = list.find_partition("orders", 3).unwrap();
        assert_eq!(element.offset(), Offset::Offset(42));
        assert_eq!(list.count(), 1);
    }

    #[tokio::test]
    #[ignore] // 需要 Kafka 实例
    async fn test_rdkafka_round_trip() {
        let producer_settings =
            ProducerSettings::from_config(&ProducerConfig::new(vec!["localhost:9092".into()])).unwrap();
        let writer = RdkafkaWriter::connect(&producer_settings).await.unwrap();
        writer
            .write_messages(vec![ProducerRecord::borrowed("test_topic", None, b"hello")])
            .await
            .unwrap();
        writer.close().await;
    }
}
