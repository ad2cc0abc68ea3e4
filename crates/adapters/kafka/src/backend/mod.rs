//! 后端选择
//!
//! 根据配置中的 `backend` 创建对应的 reader / writer，并在构造期做后端能力校验。

mod rdkafka_client;
mod rskafka_client;

use std::sync::Arc;

use conduit_config::Backend;
use conduit_errors::MessagingResult;

pub use self::rdkafka_client::{
    ClientLogContext, RdkafkaReader, RdkafkaWriter, consumer_entries, producer_entries,
};
pub use self::rskafka_client::{RskafkaReader, RskafkaWriter};

use crate::config::{ConsumerSettings, ProducerSettings};
use crate::transport::{MessageReader, MessageWriter};

/// 后端不支持的 Consumer 选项在这里拒绝
pub fn validate_consumer(settings: &ConsumerSettings) -> MessagingResult<()> {
    match settings.backend {
        Backend::Rdkafka => Ok(()),
        Backend::Rskafka => rskafka_client::validate_consumer(settings),
    }
}

/// 后端不支持的 Producer 选项在这里拒绝
pub fn validate_producer(settings: &ProducerSettings) -> MessagingResult<()> {
    match settings.backend {
        Backend::Rdkafka => Ok(()),
        Backend::Rskafka => rskafka_client::validate_producer(settings),
    }
}

pub async fn connect_reader(settings: &ConsumerSettings) -> MessagingResult<Box<dyn MessageReader>> {
    Ok(match settings.backend {
        Backend::Rdkafka => Box::new(RdkafkaReader::connect(settings).await?),
        Backend::Rskafka => Box::new(RskafkaReader::connect(settings).await?),
    })
}

pub async fn connect_writer(settings: &ProducerSettings) -> MessagingResult<Arc<dyn MessageWriter>> {
    Ok(match settings.backend {
        Backend::Rdkafka => Arc::new(RdkafkaWriter::connect(settings).await?),
        Backend::Rskafka => Arc::new(RskafkaWriter::connect(settings).await?),
    })
}
