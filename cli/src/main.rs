//! kafka-cli - 命令行生产 / 消费工具

mod consumer;
mod producer;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use conduit_bootstrap::{ShutdownController, init_runtime, watch_signals};
use conduit_config::{Backend, ConfigLoader, ConsumerConfig, ProducerConfig};
use serde::Serialize;
use serde_json::json;
use tracing::error;

const DEFAULT_BROKER: &str = "127.0.0.1:9092";
const DEFAULT_TOPIC: &str = "test_topic";

#[derive(Parser)]
#[command(name = "kafka-cli")]
#[command(about = "Produce to and consume from Kafka topics")]
struct Cli {
    /// Kafka brokers, comma separated [default: 127.0.0.1:9092]
    #[arg(short = 'k', long, value_delimiter = ',', global = true)]
    brokers: Option<Vec<String>>,

    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Client implementation: rdkafka | rskafka
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Debug logging, and message metadata in consumer output
    #[arg(long, global = true)]
    verbose: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume topics and print every message value
    Consumer {
        /// Topics to consume [default: test_topic]
        #[arg(short, long, value_delimiter = ',')]
        topics: Option<Vec<String>>,

        /// Consumer group [default: test_group]
        #[arg(short, long)]
        group: Option<String>,

        /// first | last | backend-native value [default: last]
        #[arg(short, long)]
        start_offset: Option<String>,

        /// Kafka version, e.g. 2.8.1
        #[arg(short = 'v', long)]
        version: Option<String>,
    },
    /// Send random or typed messages to a topic
    Producer {
        /// Topic to send to
        #[arg(short, long, default_value = DEFAULT_TOPIC)]
        topic: String,

        /// Compression: none | gzip | snappy | lz4 | zstd
        #[arg(short = 'p', long)]
        compression: Option<String>,

        /// Do not wait for delivery
        #[arg(short, long = "async")]
        async_mode: bool,

        /// Kafka version, e.g. 2.8.1
        #[arg(short = 'v', long)]
        version: Option<String>,

        /// Send each line typed on stdin
        #[arg(long = "type")]
        type_mode: bool,

        /// Send interval in auto mode, e.g. 500ms, 2s, 1m
        #[arg(long, default_value = "2s", value_parser = producer::parse_interval)]
        interval: Duration,
    },
}

#[derive(Serialize)]
struct TelemetryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    log_json: Option<bool>,
}

#[derive(Serialize)]
struct ConsumerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    addresses: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Serialize)]
struct ProducerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    addresses: Option<Vec<String>>,
    #[serde(rename = "async", skip_serializing_if = "Option::is_none")]
    async_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

async fn run(cli: Cli, loader: ConfigLoader, shutdown: ShutdownController) -> anyhow::Result<()> {
    match cli.command {
        Command::Consumer {
            topics,
            group,
            start_offset,
            version,
        } => {
            let defaults = json!({
                "addresses": [DEFAULT_BROKER],
                "topics": [DEFAULT_TOPIC],
                "group_id": "test_group",
                "start_offset": "last",
            });
            let overrides = ConsumerOverrides {
                backend: cli.backend,
                addresses: cli.brokers,
                topics,
                group_id: group,
                start_offset,
                version,
            };
            let config: ConsumerConfig = loader.load(&defaults, &overrides)?;
            consumer::run(config, cli.verbose, shutdown).await
        }
        Command::Producer {
            topic,
            compression,
            async_mode,
            version,
            type_mode,
            interval,
        } => {
            let defaults = json!({ "addresses": [DEFAULT_BROKER] });
            let overrides = ProducerOverrides {
                backend: cli.backend,
                addresses: cli.brokers,
                async_mode: async_mode.then_some(true),
                compression,
                version,
            };
            let config: ProducerConfig = loader.load(&defaults, &overrides)?;
            let mode = if type_mode {
                producer::Mode::Type
            } else {
                producer::Mode::Auto(interval)
            };
            producer::run(config, topic, mode, shutdown).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let loader = ConfigLoader::new().with_file(cli.config.clone());

    let telemetry = match loader.load_telemetry(&TelemetryOverrides {
        log_json: cli.log_json.then_some(true),
    }) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("kafka-cli: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_runtime(&telemetry, cli.verbose);

    let shutdown = ShutdownController::new();
    let signals = shutdown.clone();
    let watcher = tokio::spawn(async move {
        if let Err(e) = watch_signals(signals).await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    let result = run(cli, loader, shutdown).await;
    watcher.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "kafka-cli failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_consumer_flags() {
        let cli = Cli::parse_from([
            "kafka-cli", "-k", "b1:9092,b2:9092", "consumer", "-t", "a,b", "-g", "g1", "-s", "first",
        ]);
        assert_eq!(cli.brokers, Some(vec!["b1:9092".to_string(), "b2:9092".to_string()]));
        match cli.command {
            Command::Consumer {
                topics,
                group,
                start_offset,
                version,
            } => {
                assert_eq!(topics, Some(vec!["a".to_string(), "b".to_string()]));
                assert_eq!(group.as_deref(), Some("g1"));
                assert_eq!(start_offset.as_deref(), Some("first"));
                assert_eq!(version, None);
            }
            Command::Producer { .. } => panic!("expected consumer"),
        }
    }

    #[test]
    fn test_producer_defaults() {
        let cli = Cli::parse_from(["kafka-cli", "producer", "--backend", "RSKAFKA", "-a"]);
        assert_eq!(cli.backend, Some(Backend::Rskafka));
        match cli.command {
            Command::Producer {
                topic,
                async_mode,
                type_mode,
                interval,
                ..
            } => {
                assert_eq!(topic, DEFAULT_TOPIC);
                assert!(async_mode);
                assert!(!type_mode);
                assert_eq!(interval, Duration::from_secs(2));
            }
            Command::Consumer { .. } => panic!("expected producer"),
        }
    }

    #[test]
    fn test_overrides_skip_unset_fields() {
        let overrides = ProducerOverrides {
            backend: None,
            addresses: None,
            async_mode: Some(true),
            compression: None,
            version: None,
        };
        assert_eq!(serde_json::to_value(&overrides).unwrap(), json!({ "async": true }));
    }
}
