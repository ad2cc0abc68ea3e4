//! 后端能力接口
//!
//! 适配器只依赖这两个 trait，具体客户端（rdkafka / rskafka / 测试替身）
//! 各自实现。

use std::borrow::Cow;

use async_trait::async_trait;
use conduit_errors::MessagingResult;
use conduit_ports::Envelope;

/// 待写出的一条记录
///
/// 同步路径借用调用方的缓冲区；异步路径在交给后台任务前调用
/// [`ProducerRecord::into_owned`]，调用方返回后可以随意复用缓冲区。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord<'a> {
    pub topic: Cow<'a, str>,
    pub key: Option<Cow<'a, [u8]>>,
    pub value: Cow<'a, [u8]>,
}

impl<'a> ProducerRecord<'a> {
    pub fn borrowed(topic: &'a str, key: Option<&'a [u8]>, value: &'a [u8]) -> Self {
        Self {
            topic: Cow::Borrowed(topic),
            key: key.map(Cow::Borrowed),
            value: Cow::Borrowed(value),
        }
    }

    /// 拷贝出不再借用调用方内存的记录
    pub fn into_owned(self) -> ProducerRecord<'static> {
        ProducerRecord {
            topic: Cow::Owned(self.topic.into_owned()),
            key: self.key.map(|k| Cow::Owned(k.into_owned())),
            value: Cow::Owned(self.value.into_owned()),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.value, Cow::Owned(_))
            && matches!(self.topic, Cow::Owned(_))
            && self.key.as_ref().is_none_or(|k| matches!(k, Cow::Owned(_)))
    }

    /// 记录占用的字节数（key + value）
    pub fn size(&self) -> usize {
        self.value.len() + self.key.as_ref().map_or(0, |k| k.len())
    }
}

/// 逐条读取消息的能力
#[async_trait]
pub trait MessageReader: Send {
    /// 读取下一条消息；阻塞直到有消息、出错或读端被关闭
    async fn read(&mut self) -> MessagingResult<Envelope>;

    /// 消息进入队列后调用；只有需要逐条提交的客户端才覆盖
    async fn commit(&mut self, _topic: &str, _partition: i32, _offset: i64) -> MessagingResult<()> {
        Ok(())
    }

    /// 释放底层客户端
    async fn close(&mut self);
}

/// 批量写出消息的能力
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// 写出一批记录；同步模式下返回前记录已被 broker 确认
    async fn write_messages(&self, records: Vec<ProducerRecord<'_>>) -> MessagingResult<()>;

    /// 刷出缓冲区并释放底层客户端
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_owned_detaches_from_caller() {
        let mut buf = b"hello".to_vec();
        let record = ProducerRecord::borrowed("t1", Some(b"k"), &buf).into_owned();
        buf[0] = b'j';

        assert!(record.is_owned());
        assert_eq!(record.value.as_ref(), b"hello");
        assert_eq!(record.size(), 6);
    }

    #[test]
    fn test_borrowed_record() {
        let record = ProducerRecord::borrowed("t1", None, b"abc");
        assert!(!record.is_owned());
        assert_eq!(record.size(), 3);
    }
}
