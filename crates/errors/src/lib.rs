//! conduit-errors - 统一错误处理
//!
//! Producer / Consumer 门面的错误分类：
//! - 构造期错误（配置非法、选项不支持）在后台任务启动前返回
//! - 运行期错误（传输失败、已关闭）由适配器按调用路径决定记录或返回

use thiserror::Error;

/// 消息门面错误类型
#[derive(Debug, Error)]
pub enum MessagingError {
    /// 配置字段缺失或非法
    #[error("Config error: {field}: {reason}")]
    Config { field: &'static str, reason: String },

    /// 枚举型选项取值不在允许列表中
    #[error("Unsupported option: {field} `{value}`")]
    UnsupportedOption { field: &'static str, value: String },

    /// 底层客户端返回的连接 / IO 错误
    #[error("Transport error: {0}")]
    Transport(String),

    /// 适配器已停止
    #[error("Closed: adapter is stopped")]
    Closed,

    #[error("Already started")]
    AlreadyStarted,
}

impl MessagingError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    pub fn unsupported(field: &'static str, value: impl Into<String>) -> Self {
        Self::UnsupportedOption {
            field,
            value: value.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// 是否为“已关闭 / 已取消”一类错误，拉取循环据此退出
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// 是否为构造期错误
    pub fn is_construction_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::UnsupportedOption { .. })
    }

    /// 出错的配置字段名
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Config { field, .. } | Self::UnsupportedOption { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Result 类型别名
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MessagingError::Closed.is_closed());
        assert!(!MessagingError::transport("broken pipe").is_closed());

        let err = MessagingError::config("group_id", "group_id is empty");
        assert!(err.is_construction_error());
        assert_eq!(err.field(), Some("group_id"));

        let err = MessagingError::unsupported("compression", "brotli");
        assert!(err.is_construction_error());
        assert_eq!(err.to_string(), "Unsupported option: compression `brotli`");

        assert_eq!(MessagingError::transport("eof").field(), None);
    }
}
