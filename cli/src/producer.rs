use std::time::{Duration, Instant};

use conduit_adapter_kafka::KafkaProducer;
use conduit_bootstrap::ShutdownController;
use conduit_config::ProducerConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

/// 发送方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 逐行发送标准输入
    Type,
    /// 按间隔发送 4 个随机字节的 hex 编码
    Auto(Duration),
}

/// 解析 `500ms` / `2s` / `1m` 形式的间隔，纯数字按秒处理
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid interval `{raw}`"))?;

    let interval = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("interval `{raw}` is too large"))?,
        _ => return Err(format!("invalid interval unit in `{raw}`, expected ms, s or m")),
    };
    if interval.is_zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(interval)
}

/// 发送消息，直到收到关闭信号（或标准输入结束）
pub async fn run(
    config: ProducerConfig,
    topic: String,
    mode: Mode,
    shutdown: ShutdownController,
) -> anyhow::Result<()> {
    debug!(config = ?config, "Producer config");

    let producer = KafkaProducer::connect(&config).await?;
    let result = match mode {
        Mode::Type => type_mode(&producer, &topic, &shutdown).await,
        Mode::Auto(interval) => auto_mode(&producer, &topic, interval, &shutdown).await,
    };
    producer.stop().await;
    result
}

async fn send(producer: &KafkaProducer, topic: &str, message: &[u8]) -> bool {
    let start = Instant::now();
    match producer.send(topic, message).await {
        Ok(()) => {
            info!(
                message = %String::from_utf8_lossy(message),
                spent = ?start.elapsed(),
                "Message sent"
            );
            true
        }
        Err(e) if e.is_closed() => false,
        Err(e) => {
            error!(error = %e, "Failed to send message");
            true
        }
    }
}

async fn type_mode(producer: &KafkaProducer, topic: &str, shutdown: &ShutdownController) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let line = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Input closed");
            return Ok(());
        };
        if !send(producer, topic, line.as_bytes()).await {
            return Ok(());
        }
    }
}

async fn auto_mode(
    producer: &KafkaProducer,
    topic: &str,
    interval: Duration,
    shutdown: &ShutdownController,
) -> anyhow::Result<()> {
    info!(interval = ?interval, "Sending random bytes every interval");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let message = hex::encode(rand::random::<[u8; 4]>());
        if !send(producer, topic, message.as_bytes()).await {
            return Ok(());
        }
    }
}
