//! conduit-bootstrap - 命令行进程启动骨架
//!
//! 日志初始化与两段式信号关闭

mod runtime;
mod shutdown;

pub use runtime::*;
pub use shutdown::*;
