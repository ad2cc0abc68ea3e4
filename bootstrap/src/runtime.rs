//! 进程运行时：日志初始化与信号处理

use std::io;

use conduit_config::TelemetryConfig;
use conduit_telemetry::{init_tracing, init_tracing_json, level_for};
use tracing::{debug, info};

use crate::shutdown::{ShutdownController, ShutdownPhase};

/// 强制退出时的进程退出码（128 + SIGINT）
pub const FORCED_EXIT_CODE: i32 = 130;

/// 初始化运行时
pub fn init_runtime(telemetry: &TelemetryConfig, verbose: bool) {
    let level = level_for(verbose, &telemetry.log_level);
    if telemetry.log_json {
        init_tracing_json(level);
    } else {
        init_tracing(level);
    }

    info!(log_level = level, log_json = telemetry.log_json, "Runtime initialized");
}

#[cfg(unix)]
async fn next_signal(terminate: &mut tokio::signal::unix::Signal) -> io::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn next_signal(_: &mut ()) -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// 监听 SIGINT / SIGTERM：第一次触发优雅关闭，第二次以 130 退出进程
pub async fn watch_signals(shutdown: ShutdownController) -> io::Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(not(unix))]
    let mut terminate = ();

    loop {
        next_signal(&mut terminate).await?;
        match shutdown.on_signal() {
            ShutdownPhase::Graceful => debug!("Waiting for in-flight work"),
            ShutdownPhase::Forced => std::process::exit(FORCED_EXIT_CODE),
        }
    }
}
