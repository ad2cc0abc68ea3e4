//! Producer / Consumer trait 定义

use async_trait::async_trait;
use conduit_errors::MessagingResult;

use crate::{Envelope, MessageQueue};

/// 消息生产者
#[async_trait]
pub trait Producer: Send + Sync {
    /// 发送不带 key 的消息
    async fn send(&self, topic: &str, value: &[u8]) -> MessagingResult<()>;

    /// 发送带 key 的消息
    async fn send_with_key(&self, topic: &str, key: &[u8], value: &[u8]) -> MessagingResult<()>;

    /// 停止生产者，等待在途消息写完后释放底层客户端；重复调用无副作用
    async fn stop(&self);
}

/// 消息消费者
#[async_trait]
pub trait Consumer: Send + Sync {
    /// 启动后台拉取循环
    fn start(&self) -> MessagingResult<()>;

    /// 获取消息队列；拉取循环退出时队列关闭
    fn receive(&self) -> MessagingResult<MessageQueue<Envelope>>;

    /// 停止消费者；重复调用无副作用
    async fn stop(&self);
}
