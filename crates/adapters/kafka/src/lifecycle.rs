//! 适配器生命周期：Created → Running → Stopping → Stopped

use std::sync::atomic::{AtomicU8, Ordering};

use conduit_errors::{MessagingError, MessagingResult};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Created,
            1 => State::Running,
            2 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

/// 状态机 + 取消信号
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Created as u8),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// 直接处于 Running 的生命周期（Producer 构造即可用）
    pub fn running() -> Self {
        let lifecycle = Self::new();
        lifecycle.state.store(State::Running as u8, Ordering::Release);
        lifecycle
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Created → Running
    pub fn start(&self) -> MessagingResult<()> {
        match self.state.compare_exchange(
            State::Created as u8,
            State::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if State::from_u8(current) == State::Running => {
                Err(MessagingError::AlreadyStarted)
            }
            Err(_) => Err(MessagingError::Closed),
        }
    }

    /// 进入 Stopping 并触发取消；只有第一个调用者返回 `Some`，值为停止前的状态
    pub fn begin_stop(&self) -> Option<State> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = State::from_u8(current);
            if matches!(state, State::Stopping | State::Stopped) {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                State::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.cancel.cancel();
                    return Some(state);
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn finish_stop(&self) {
        self.state.store(State::Stopped as u8, Ordering::Release);
        self.stopped.cancel();
    }

    /// 等待进入 Stopped
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// 已开始停止或已停止
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), State::Stopping | State::Stopped)
    }

    pub fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            Err(MessagingError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), State::Created);
        lifecycle.start().unwrap();
        assert_eq!(lifecycle.state(), State::Running);
        assert!(matches!(lifecycle.start(), Err(MessagingError::AlreadyStarted)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let lifecycle = Lifecycle::running();
        let token = lifecycle.token();

        assert_eq!(lifecycle.begin_stop(), Some(State::Running));
        assert!(token.is_cancelled());
        assert_eq!(lifecycle.begin_stop(), None);

        lifecycle.finish_stop();
        assert_eq!(lifecycle.state(), State::Stopped);
        assert_eq!(lifecycle.begin_stop(), None);
        assert!(lifecycle.ensure_open().unwrap_err().is_closed());
    }

    #[test]
    fn test_start_after_stop_is_closed() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.begin_stop(), Some(State::Created));
        lifecycle.finish_stop();
        assert!(lifecycle.start().unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_finish() {
        let lifecycle = Lifecycle::running();
        lifecycle.begin_stop();

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), lifecycle.stopped()).await;
        assert!(pending.is_err());

        lifecycle.finish_stop();
        lifecycle.stopped().await;
    }
}
