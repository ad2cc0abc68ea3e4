//! 有界批量分发模块
//!
//! 每次写入在后台任务中执行，同时在途的写入数不超过上限；
//! 写入失败只记录日志，不回传给调用方。

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use conduit_errors::{MessagingError, MessagingResult};
use metrics::{counter, gauge};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error};

use crate::transport::{MessageWriter, ProducerRecord};

/// 一次在途写入持有的凭据：并发许可 + 追踪令牌，随任务结束一起释放
struct SendTicket {
    _permit: OwnedSemaphorePermit,
    _token: TaskTrackerToken,
}

/// 有界分发器
pub struct BatchDispatcher {
    inner: Arc<dyn MessageWriter>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    closing: AtomicBool,
    surface_errors: bool,
}

impl BatchDispatcher {
    pub fn new(inner: Arc<dyn MessageWriter>, bound: NonZeroUsize, surface_errors: bool) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(bound.get())),
            tracker: TaskTracker::new(),
            closing: AtomicBool::new(false),
            surface_errors,
        }
    }

    /// 当前在途写入数
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    async fn dispatch(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
        // 先拿追踪令牌再检查关闭标志，close 的 wait 一定能看到这次写入
        let token = self.tracker.token();
        if self.closing.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| MessagingError::Closed)?;

        let records: Vec<ProducerRecord<'static>> =
            records.into_iter().map(ProducerRecord::into_owned).collect();
        let ticket = SendTicket {
            _permit: permit,
            _token: token,
        };
        let writer = Arc::clone(&self.inner);
        let surface_errors = self.surface_errors;

        gauge!("kafka_dispatch_in_flight").increment(1.0);
        tokio::spawn(async move {
            let _ticket = ticket;
            let count = records.len();
            match writer.write_messages(records).await {
                Ok(()) => {
                    debug!(count, "Dispatched write completed");
                    counter!("kafka_messages_sent_total").increment(count as u64);
                }
                Err(e) => {
                    counter!("kafka_dispatch_failures_total").increment(1);
                    if surface_errors {
                        error!(count, error = %e, "Dispatched write failed");
                    } else {
                        debug!(count, error = %e, "Dispatched write failed");
                    }
                }
            }
            gauge!("kafka_dispatch_in_flight").decrement(1.0);
        });

        Ok(())
    }
}

#[async_trait]
impl MessageWriter for BatchDispatcher {
    async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()> {
        self.dispatch(records).await
    }

    /// 拒绝新写入，等待全部在途写入结束后关闭底层 writer
    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            self.tracker.wait().await;
            return;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.permits.close();
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeWriter;

    fn bound(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let fake = FakeWriter::new().with_delay(Duration::from_millis(20));
        let dispatcher = BatchDispatcher::new(Arc::new(fake.clone()), bound(3), true);

        for i in 0..12u8 {
            let value = [i];
            dispatcher
                .write_messages(vec![ProducerRecord::borrowed("t1", None, &value)])
                .await
                .unwrap();
            assert!(dispatcher.in_flight() <= 3);
        }
        dispatcher.close().await;

        assert_eq!(fake.write_count(), 12);
        assert!(fake.max_concurrent() <= 3);
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_all_writes() {
        let fake = FakeWriter::new().with_delay(Duration::from_millis(10));
        let dispatcher = BatchDispatcher::new(Arc::new(fake.clone()), bound(8), true);

        for _ in 0..5 {
            dispatcher
                .write_messages(vec![ProducerRecord::borrowed("t1", None, b"x")])
                .await
                .unwrap();
        }
        dispatcher.close().await;

        assert_eq!(fake.write_count(), 5);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_returned() {
        let fake = FakeWriter::new().failing();
        let dispatcher = BatchDispatcher::new(Arc::new(fake.clone()), bound(1), false);

        let result = dispatcher
            .write_messages(vec![ProducerRecord::borrowed("t1", None, b"x")])
            .await;
        assert!(result.is_ok());

        dispatcher.close().await;
        assert_eq!(fake.write_count(), 1);
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let fake = FakeWriter::new();
        let dispatcher = BatchDispatcher::new(Arc::new(fake.clone()), bound(2), true);
        dispatcher.close().await;

        let err = dispatcher
            .write_messages(vec![ProducerRecord::borrowed("t1", None, b"x")])
            .await
            .unwrap_err();
        assert!(err.is_closed());
        assert_eq!(fake.write_count(), 0);
    }
}
