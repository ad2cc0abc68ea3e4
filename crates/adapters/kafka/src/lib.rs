//! conduit-adapter-kafka - Kafka 适配器
//!
//! 与后端无关的 Producer / Consumer 门面：
//! - 配置归一化（大小写不敏感的枚举、零值回退、构造期校验）
//! - 后台拉取循环 + 有界消息队列
//! - 同步 / 异步发送，可选的有界批量分发
//! - 两种后端：librdkafka（rdkafka）与纯 Rust 客户端（rskafka）

pub mod backend;
mod batch;
mod config;
mod consumer;
mod lifecycle;
mod partitioner;
mod producer;
pub mod testing;
mod transport;

pub use batch::*;
pub use config::*;
pub use consumer::*;
pub use lifecycle::*;
pub use partitioner::*;
pub use producer::*;
pub use transport::*;
