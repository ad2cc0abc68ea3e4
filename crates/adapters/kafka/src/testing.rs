//! 内存中的传输替身，用于在没有 broker 的情况下驱动适配器

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conduit_errors::{MessagingError, MessagingResult};
use conduit_ports::Envelope;

use crate::transport::{MessageReader, MessageWriter, ProducerRecord};

/// 被写出的一条记录的拷贝
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

#[derive(Default)]
struct WriterState {
    writes: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicBool,
    records: Mutex<Vec<WrittenRecord>>,
}

/// 记录所有写入的 writer；克隆共享同一份状态
#[derive(Clone, Default)]
pub struct FakeWriter {
    state: Arc<WriterState>,
    delay: Option<Duration>,
    fail: bool,
    blocking_close: bool,
}

impl FakeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次写入前等待一段时间
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次写入都返回传输错误
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// `close` 永远不返回
    pub fn with_blocking_close(mut self) -> Self {
        self.blocking_close = true;
        self
    }

    /// `write_messages` 被调用的次数
    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// 观察到的最大同时写入数
    pub fn max_concurrent(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<WrittenRecord> {
        self.state
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageWriter for FakeWriter {
    async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
        let state = &self.state;
        state.writes.fetch_add(1, Ordering::SeqCst);
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.fail {
            Err(MessagingError::transport("broker unavailable"))
        } else {
            let mut written = state.records.lock().unwrap_or_else(PoisonError::into_inner);
            written.extend(records.into_iter().map(|r| WrittenRecord {
                topic: r.topic.into_owned(),
                key: r.key.map(|k| k.into_owned()),
                value: r.value.into_owned(),
            }));
            Ok(())
        };

        state.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if self.blocking_close {
            std::future::pending::<()>().await;
        }
    }
}

/// [`FakeReader`] 依次返回的结果
#[derive(Debug, Clone)]
pub enum ReadStep {
    Message(Envelope),
    TransportError(String),
    Closed,
}

/// 按脚本返回消息的 reader；脚本耗尽后一直挂起，直到被取消
#[derive(Default)]
pub struct FakeReader {
    steps: VecDeque<ReadStep>,
    reads: Arc<AtomicUsize>,
    commits: Arc<Mutex<Vec<i64>>>,
    closed: Arc<AtomicBool>,
    blocking_close: bool,
}

impl FakeReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(envelopes: impl IntoIterator<Item = Envelope>) -> Self {
        Self {
            steps: envelopes.into_iter().map(ReadStep::Message).collect(),
            ..Self::default()
        }
    }

    pub fn then(mut self, step: ReadStep) -> Self {
        self.steps.push_back(step);
        self
    }

    /// 标记关闭后永远不返回
    pub fn with_blocking_close(mut self) -> Self {
        self.blocking_close = true;
        self
    }

    /// 观察 reader 是否已被关闭
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// 从脚本中成功取出的消息数
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    /// 已提交的 offset，按提交顺序
    pub fn commit_log(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.commits)
    }
}

#[async_trait]
impl MessageReader for FakeReader {
    async fn read(&mut self) -> MessagingResult<Envelope> {
        match self.steps.pop_front() {
            Some(ReadStep::Message(envelope)) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(envelope)
            }
            Some(ReadStep::TransportError(msg)) => Err(MessagingError::transport(msg)),
            Some(ReadStep::Closed) => Err(MessagingError::Closed),
            None => std::future::pending().await,
        }
    }

    async fn commit(&mut self, _topic: &str, _partition: i32, offset: i64) -> MessagingResult<()> {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(offset);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.blocking_close {
            std::future::pending::<()>().await;
        }
    }
}
