//! 消息视图与有界消息队列

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// 收到的一条消息的只读视图
pub trait Message {
    fn value(&self) -> &[u8];
    fn topic(&self) -> &str;
    fn partition(&self) -> i32;
    fn offset(&self) -> i64;
}

/// 后端原生消息归一化后的信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    value: Vec<u8>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// 取出消息体
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }
}

impl Message for Envelope {
    fn value(&self) -> &[u8] {
        &self.value
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn offset(&self) -> i64 {
        self.offset
    }
}

/// 有界消息队列的接收端
///
/// 可克隆，多个任务可以同时从同一队列取消息；发送端全部释放后
/// `recv` 返回 `None`。
pub struct MessageQueue<M> {
    inner: Arc<Mutex<mpsc::Receiver<M>>>,
}

impl<M> Clone for MessageQueue<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue").finish_non_exhaustive()
    }
}

impl<M> MessageQueue<M> {
    /// 创建容量为 `capacity` 的队列（最小为 1）
    pub fn bounded(capacity: usize) -> (mpsc::Sender<M>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                inner: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// 等待下一条消息，队列关闭且已取空时返回 `None`
    pub async fn recv(&self) -> Option<M> {
        self.inner.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_view() {
        let envelope = Envelope::new("orders", 3, 42, b"hello".to_vec());
        assert_eq!(envelope.topic(), "orders");
        assert_eq!(envelope.partition(), 3);
        assert_eq!(envelope.offset(), 42);
        assert_eq!(envelope.value(), b"hello");
        assert_eq!(envelope.into_value(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_queue_closes_after_sender_dropped() {
        let (tx, queue) = MessageQueue::bounded(0);
        let reader = queue.clone();

        tx.send(1).await.unwrap();
        drop(tx);

        assert_eq!(reader.recv().await, Some(1));
        assert_eq!(queue.recv().await, None);
        assert_eq!(reader.recv().await, None);
    }
}
