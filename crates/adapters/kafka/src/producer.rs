//! Kafka Producer
//!
//! 提供消息发布功能

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::ProducerConfig;
use conduit_errors::MessagingResult;
use conduit_ports::Producer;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::backend;
use crate::batch::BatchDispatcher;
use crate::config::ProducerSettings;
use crate::lifecycle::{Lifecycle, State};
use crate::transport::{MessageWriter, ProducerRecord};

/// Kafka Producer 适配器
pub struct KafkaProducer {
    writer: Arc<dyn MessageWriter>,
    lifecycle: Lifecycle,
    /// 异步模式下 send 返回前拷贝消息体
    copy_payload: bool,
    dispatched: bool,
    fire_and_forget: bool,
    shutdown_timeout: Duration,
}

impl KafkaProducer {
    /// 校验配置并连接后端
    pub async fn connect(config: &ProducerConfig) -> MessagingResult<Self> {
        let settings = ProducerSettings::from_config(config)?;
        let writer = backend::connect_writer(&settings).await?;

        info!(
            backend = %settings.backend,
            async_mode = settings.async_mode,
            dispatch_bound = settings.dispatch_bound.map(|b| b.get()),
            "Kafka producer created"
        );

        Ok(Self::with_writer(&settings, writer))
    }

    /// 使用已有 writer 创建；配置了并发上限时在 writer 外包一层有界分发器
    pub fn with_writer(settings: &ProducerSettings, writer: Arc<dyn MessageWriter>) -> Self {
        let (writer, dispatched): (Arc<dyn MessageWriter>, bool) = match settings.dispatch_bound {
            Some(bound) => (
                Arc::new(BatchDispatcher::new(writer, bound, settings.surface_async_errors)),
                true,
            ),
            None => (writer, false),
        };

        Self {
            writer,
            lifecycle: Lifecycle::running(),
            copy_payload: settings.async_mode,
            dispatched,
            fire_and_forget: settings.fire_and_forget(),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// 发送不带 key 的消息
    pub async fn send(&self, topic: &str, value: &[u8]) -> MessagingResult<()> {
        self.write(topic, None, value).await
    }

    /// 发送带 key 的消息
    pub async fn send_with_key(&self, topic: &str, key: &[u8], value: &[u8]) -> MessagingResult<()> {
        self.write(topic, Some(key), value).await
    }

    async fn write(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> MessagingResult<()> {
        self.lifecycle.ensure_open()?;

        let record = ProducerRecord::borrowed(topic, key, value);
        let record = if self.copy_payload {
            record.into_owned()
        } else {
            record
        };

        self.writer.write_messages(vec![record]).await?;

        if !self.dispatched {
            counter!("kafka_messages_sent_total").increment(1);
        }
        if self.fire_and_forget {
            debug!(topic = %topic, bytes = value.len(), "Message handed to transport");
        } else {
            debug!(topic = %topic, bytes = value.len(), "Message sent");
        }
        Ok(())
    }

    /// 等待在途消息写完并释放底层客户端（最多 `shutdown_timeout`）；重复调用无副作用
    pub async fn stop(&self) {
        if self.lifecycle.begin_stop().is_none() {
            return;
        }

        if tokio::time::timeout(self.shutdown_timeout, self.writer.close())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Kafka producer did not close in time"
            );
        }

        self.lifecycle.finish_stop();
        info!("Kafka producer stopped");
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, topic: &str, value: &[u8]) -> MessagingResult<()> {
        KafkaProducer::send(self, topic, value).await
    }

    async fn send_with_key(&self, topic: &str, key: &[u8], value: &[u8]) -> MessagingResult<()> {
        KafkaProducer::send_with_key(self, topic, key, value).await
    }

    async fn stop(&self) {
        KafkaProducer::stop(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{FakeWriter, WrittenRecord};

    fn settings(config: ProducerConfig) -> ProducerSettings {
        ProducerSettings::from_config(&config).unwrap()
    }

    fn base_config() -> ProducerConfig {
        ProducerConfig::new(vec!["localhost:9092".into()])
    }

    /// 记录每条记录到达 writer 时是否已与调用方内存分离
    #[derive(Default)]
    struct OwnershipRecorder {
        owned: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl MessageWriter for OwnershipRecorder {
        async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
            let mut owned = self.owned.lock().unwrap();
            owned.extend(records.iter().map(ProducerRecord::is_owned));
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_sync_send_writes_once() {
        let fake = FakeWriter::new();
        let producer = KafkaProducer::with_writer(
            &settings(base_config().with_required_acks(0)),
            Arc::new(fake.clone()),
        );

        producer.send("t1", b"hello").await.unwrap();

        assert_eq!(fake.write_count(), 1);
        assert_eq!(
            fake.records(),
            vec![WrittenRecord {
                topic: "t1".into(),
                key: None,
                value: b"hello".to_vec(),
            }]
        );
        producer.stop().await;
    }

    #[tokio::test]
    async fn test_send_with_key() {
        let fake = FakeWriter::new();
        let producer = KafkaProducer::with_writer(&settings(base_config()), Arc::new(fake.clone()));

        producer.send_with_key("t1", b"user-1", b"payload").await.unwrap();

        let records = fake.records();
        assert_eq!(records[0].key.as_deref(), Some(&b"user-1"[..]));
        assert_eq!(records[0].value, b"payload");
    }

    #[tokio::test]
    async fn test_sync_errors_are_returned() {
        let producer = KafkaProducer::with_writer(
            &settings(base_config()),
            Arc::new(FakeWriter::new().failing()),
        );

        let err = producer.send("t1", b"x").await.unwrap_err();
        assert!(!err.is_closed());
    }

    #[tokio::test]
    async fn test_async_mode_copies_payload() {
        let recorder = Arc::new(OwnershipRecorder::default());
        let producer = KafkaProducer::with_writer(
            &settings(base_config().with_async(true)),
            Arc::clone(&recorder) as Arc<dyn MessageWriter>,
        );

        let mut buf = b"first".to_vec();
        producer.send("t1", &buf).await.unwrap();
        buf.copy_from_slice(b"xxxxx");
        producer.send("t1", &buf).await.unwrap();

        assert_eq!(*recorder.owned.lock().unwrap(), vec![true, true]);
    }

    #[tokio::test]
    async fn test_sync_mode_borrows_payload() {
        let recorder = Arc::new(OwnershipRecorder::default());
        let producer = KafkaProducer::with_writer(
            &settings(base_config()),
            Arc::clone(&recorder) as Arc<dyn MessageWriter>,
        );

        producer.send("t1", b"hello").await.unwrap();
        assert_eq!(*recorder.owned.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_dispatch_mode_survives_buffer_reuse() {
        let fake = FakeWriter::new().with_delay(Duration::from_millis(5));
        let producer = KafkaProducer::with_writer(
            &settings(base_config().with_batch_queue_size(2)),
            Arc::new(fake.clone()),
        );

        let mut buf = [0u8; 1];
        for i in 0..6u8 {
            buf[0] = i;
            producer.send("t1", &buf).await.unwrap();
        }
        producer.stop().await;

        let mut values: Vec<u8> = fake.records().into_iter().map(|r| r.value[0]).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert!(fake.max_concurrent() <= 2);
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn test_dispatch_failures_are_swallowed() {
        let fake = FakeWriter::new().failing();
        let producer = KafkaProducer::with_writer(
            &settings(base_config().with_batch_queue_size(1)),
            Arc::new(fake.clone()),
        );

        assert!(producer.send("t1", b"x").await.is_ok());
        producer.stop().await;
        assert_eq!(fake.write_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_rejects_sends() {
        let fake = FakeWriter::new();
        let producer = KafkaProducer::with_writer(&settings(base_config()), Arc::new(fake.clone()));
        assert_eq!(producer.state(), State::Running);

        producer.stop().await;
        producer.stop().await;

        assert_eq!(producer.state(), State::Stopped);
        assert!(fake.is_closed());
        assert!(producer.send("t1", b"late").await.unwrap_err().is_closed());
        assert!(producer.send_with_key("t1", b"k", b"late").await.unwrap_err().is_closed());
        assert_eq!(fake.write_count(), 0);
    }

    #[tokio::test]
    async fn test_blocking_close_is_bounded() {
        let mut config = base_config();
        config.shutdown_timeout_ms = 100;
        let fake = FakeWriter::new().with_blocking_close();
        let producer = KafkaProducer::with_writer(&settings(config), Arc::new(fake.clone()));
        producer.send("t1", b"hello").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), producer.stop())
            .await
            .expect("stop blocked on writer close");
        assert_eq!(producer.state(), State::Stopped);
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn test_dispatch_drains_before_blocking_close() {
        let mut config = base_config().with_batch_queue_size(2);
        config.shutdown_timeout_ms = 200;
        let fake = FakeWriter::new()
            .with_delay(Duration::from_millis(20))
            .with_blocking_close();
        let producer = KafkaProducer::with_writer(&settings(config), Arc::new(fake.clone()));
        for _ in 0..3 {
            producer.send("t1", b"payload").await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), producer.stop())
            .await
            .expect("stop blocked on writer close");
        assert_eq!(fake.records().len(), 3);
        assert!(fake.is_closed());
    }
}
