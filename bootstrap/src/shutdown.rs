//! Graceful Shutdown
//!
//! 第一次信号触发优雅退出，第二次信号强制退出。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 收到信号后应进入的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// 停止接收新工作，等待在途工作完成
    Graceful,
    /// 放弃等待，立即退出
    Forced,
}

/// Shutdown 控制器
#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    signals: Arc<AtomicUsize>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            signals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 记录一次外部信号并返回对应阶段
    pub fn on_signal(&self) -> ShutdownPhase {
        if self.signals.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("Shutdown signal received, draining");
            self.token.cancel();
            ShutdownPhase::Graceful
        } else {
            warn!("Second shutdown signal received, forcing exit");
            ShutdownPhase::Forced
        }
    }

    /// 不经信号直接触发关闭
    pub fn shutdown(&self) {
        info!("Triggering shutdown");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 等待关闭信号
    pub fn wait(&self) -> impl Future<Output = ()> + Send + '_ {
        self.token.cancelled()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行任务直到其结束或收到关闭信号；关闭时返回 `None`
pub async fn run_until_shutdown<Fut>(shutdown: &ShutdownController, task: Fut) -> Option<Fut::Output>
where
    Fut: Future,
{
    tokio::select! {
        _ = shutdown.wait() => {
            info!("Task cancelled due to shutdown");
            None
        }
        output = task => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_graceful_second_forced() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutdown());

        assert_eq!(controller.on_signal(), ShutdownPhase::Graceful);
        assert!(controller.is_shutdown());
        assert_eq!(controller.on_signal(), ShutdownPhase::Forced);
        assert_eq!(controller.on_signal(), ShutdownPhase::Forced);
    }

    #[test]
    fn test_clones_share_state() {
        let controller = ShutdownController::new();
        let clone = controller.clone();
        clone.on_signal();
        assert!(controller.token().is_cancelled());
        assert_eq!(controller.on_signal(), ShutdownPhase::Forced);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let controller = ShutdownController::new();
        assert_eq!(run_until_shutdown(&controller, async { 7 }).await, Some(7));

        controller.shutdown();
        let pending = std::future::pending::<()>();
        assert_eq!(run_until_shutdown(&controller, pending).await, None);
    }
}
