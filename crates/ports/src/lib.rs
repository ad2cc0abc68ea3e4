//! ports - 抽象 trait 层
//!
//! 定义 Producer / Consumer 门面契约，与具体后端无关

mod message;
mod messaging;

pub use message::*;
pub use messaging::*;
