use conduit_adapter_kafka::KafkaConsumer;
use conduit_bootstrap::ShutdownController;
use conduit_config::ConsumerConfig;
use conduit_ports::{Envelope, Message};
use tracing::{debug, info};

fn render(message: &Envelope, verbose: bool) -> String {
    let value = String::from_utf8_lossy(message.value());
    if verbose {
        format!(
            "Topic: {} Partition: {} Offset: {}\n{}",
            message.topic(),
            message.partition(),
            message.offset(),
            value
        )
    } else {
        value.into_owned()
    }
}

/// 消费并打印消息，直到收到关闭信号
pub async fn run(config: ConsumerConfig, verbose: bool, shutdown: ShutdownController) -> anyhow::Result<()> {
    debug!(config = ?config, "Consumer config");

    let consumer = KafkaConsumer::connect(&config).await?;
    let queue = consumer.receive()?;
    let printer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            println!("{}", render(&message, verbose));
        }
    });

    consumer.start()?;
    info!("Start consuming");

    shutdown.wait().await;
    info!("Stop consuming");
    consumer.stop().await;
    printer.await?;
    consumer.wait_stopped().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let message = Envelope::new("orders", 2, 17, b"hello".to_vec());
        assert_eq!(render(&message, false), "hello");
        assert_eq!(
            render(&message, true),
            "Topic: orders Partition: 2 Offset: 17\nhello"
        );
    }
}
