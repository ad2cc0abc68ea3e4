//! Kafka Consumer
//!
//! 后台拉取循环把 reader 读到的消息送入有界队列，队列容量即并发消费者数；
//! 队列满时拉取循环阻塞，形成背压。消息入队后才提交位点。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::ConsumerConfig;
use conduit_errors::{MessagingError, MessagingResult};
use conduit_ports::{Consumer, Envelope, Message, MessageQueue};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend;
use crate::config::ConsumerSettings;
use crate::lifecycle::{Lifecycle, State};
use crate::transport::MessageReader;

const INITIAL_READ_BACKOFF: Duration = Duration::from_millis(100);
const MAX_READ_BACKOFF: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 连续读错误时的等待时间，成功读取后复位
#[derive(Debug)]
struct ReadBackoff {
    initial: Duration,
    current: Duration,
}

impl ReadBackoff {
    fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_READ_BACKOFF.max(self.initial));
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Kafka Consumer 适配器
pub struct KafkaConsumer {
    reader: Mutex<Option<Box<dyn MessageReader>>>,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    queue: MessageQueue<Envelope>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Arc<Lifecycle>,
    shutdown_timeout: Duration,
    read_backoff: Duration,
}

impl KafkaConsumer {
    /// 校验配置、连接后端并创建 Consumer（尚未开始拉取）
    pub async fn connect(config: &ConsumerConfig) -> MessagingResult<Self> {
        let settings = ConsumerSettings::from_config(config)?;
        let reader = backend::connect_reader(&settings).await?;

        info!(
            backend = %settings.backend,
            group_id = %settings.group_id,
            topics = ?settings.topics,
            "Kafka consumer created"
        );

        Ok(Self::with_reader(&settings, reader))
    }

    /// 使用已有 reader 创建
    pub fn with_reader(settings: &ConsumerSettings, reader: Box<dyn MessageReader>) -> Self {
        let (sender, queue) = MessageQueue::bounded(settings.queue_capacity);
        Self {
            reader: Mutex::new(Some(reader)),
            sender: Mutex::new(Some(sender)),
            queue,
            worker: Mutex::new(None),
            lifecycle: Arc::new(Lifecycle::new()),
            shutdown_timeout: settings.shutdown_timeout,
            read_backoff: INITIAL_READ_BACKOFF,
        }
    }

    /// 设置读错误后的初始等待时间
    pub fn with_read_backoff(mut self, backoff: Duration) -> Self {
        self.read_backoff = backoff;
        self
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// 启动后台拉取循环；只能调用一次
    pub fn start(&self) -> MessagingResult<()> {
        self.lifecycle.start()?;

        let reader = lock(&self.reader).take().ok_or(MessagingError::Closed)?;
        let sender = lock(&self.sender).take().ok_or(MessagingError::Closed)?;
        let handle = tokio::spawn(pull_loop(
            reader,
            sender,
            self.lifecycle.token(),
            ReadBackoff::new(self.read_backoff),
        ));
        *lock(&self.worker) = Some(handle);

        info!("Kafka consumer started");
        Ok(())
    }

    /// 获取消息队列；拉取循环退出后队列关闭
    pub fn receive(&self) -> MessagingResult<MessageQueue<Envelope>> {
        self.lifecycle.ensure_open()?;
        Ok(self.queue.clone())
    }

    /// 请求取消后立即返回；重复调用无副作用
    ///
    /// 已从客户端读出的消息仍会送入队列，调用方继续消费队列直到关闭即可拿到全部消息。
    /// 拉取循环退出、reader 关闭后进入 Stopped（见 [`KafkaConsumer::wait_stopped`]），
    /// 超过 `shutdown_timeout` 仍未退出的拉取循环会被中止。
    pub async fn stop(&self) {
        let Some(previous) = self.lifecycle.begin_stop() else {
            return;
        };

        let lifecycle = Arc::clone(&self.lifecycle);
        let timeout = self.shutdown_timeout;
        if previous == State::Created {
            lock(&self.sender).take();
            let reader = lock(&self.reader).take();
            tokio::spawn(async move {
                if let Some(mut reader) = reader {
                    if tokio::time::timeout(timeout, reader.close()).await.is_err() {
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            "Kafka consumer reader did not close in time"
                        );
                    }
                }
                lifecycle.finish_stop();
                info!("Kafka consumer stopped");
            });
        } else {
            let handle = lock(&self.worker).take();
            tokio::spawn(reap_worker(handle, lifecycle, timeout));
        }
    }

    /// 等待 Consumer 完全停止
    pub async fn wait_stopped(&self) {
        self.lifecycle.stopped().await
    }
}

async fn reap_worker(handle: Option<JoinHandle<()>>, lifecycle: Arc<Lifecycle>, timeout: Duration) {
    if let Some(mut handle) = handle {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Kafka consumer pull loop failed"),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Kafka consumer pull loop did not exit in time, aborting"
                );
                handle.abort();
            }
        }
    }

    lifecycle.finish_stop();
    info!("Kafka consumer stopped");
}

async fn pull_loop(
    mut reader: Box<dyn MessageReader>,
    sender: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    mut backoff: ReadBackoff,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reader.read() => result,
        };

        match result {
            Ok(envelope) => {
                backoff.reset();
                counter!("kafka_messages_received_total").increment(1);

                let topic = envelope.topic().to_owned();
                let partition = envelope.partition();
                let offset = envelope.offset();
                debug!(topic = %topic, partition, offset, "Message received");

                // 已读出的消息必须入队，不与取消竞争
                if sender.send(envelope).await.is_err() {
                    break;
                }
                if let Err(e) = reader.commit(&topic, partition, offset).await {
                    error!(topic = %topic, partition, offset, error = %e, "Failed to commit offset");
                }
            }
            Err(e) if e.is_closed() => {
                debug!("Reader closed, leaving pull loop");
                break;
            }
            Err(e) => {
                counter!("kafka_consumer_read_errors_total").increment(1);
                let delay = backoff.next_delay();
                error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to read message");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    drop(sender);
    reader.close().await;
    info!("Kafka consumer pull loop exited");
}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn start(&self) -> MessagingResult<()> {
        KafkaConsumer::start(self)
    }

    fn receive(&self) -> MessagingResult<MessageQueue<Envelope>> {
        KafkaConsumer::receive(self)
    }

    async fn stop(&self) {
        KafkaConsumer::stop(self).await
    }
}
