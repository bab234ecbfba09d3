use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 安全引擎错误类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecurityError {
    /// 连接被拒绝（策略 / 限流）
    ConnectionRejected(String),
    /// 消息被拒绝（校验 / 限流 / 超长）
    MessageRejected(String),
    /// 检测到滥用行为
    AbuseDetected(String),
    /// 配置错误
    Configuration(String),
    /// 内部错误（子组件异常）
    Internal(String),
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::ConnectionRejected(msg) => write!(f, "Connection rejected: {}", msg),
            SecurityError::MessageRejected(msg) => write!(f, "Message rejected: {}", msg),
            SecurityError::AbuseDetected(msg) => write!(f, "Abuse detected: {}", msg),
            SecurityError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            SecurityError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for SecurityError {}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SecurityError>;

/// 下发给客户端的机器可读错误代码
///
/// 客户端据此做程序化处理（重试、提示、刷新 token 等），
/// 永远不向客户端暴露堆栈或内部状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// 速率超限
    RateLimitExceeded,
    /// 来源被封禁
    Blocked,
    /// 连接数超限
    ConnectionLimit,
    /// 需要管理员权限
    AdminRequired,
    /// 会话未知
    UnknownSession,
    /// 事件类型不在白名单
    EventNotAllowed,
    /// 消息超长
    MessageTooLarge,
    /// 字段校验失败
    ValidationFailed,
    /// CSRF 校验失败
    CsrfFailed,
    /// 触发滥用规则
    AbuseDetected,
    /// 内部错误
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::Blocked => "BLOCKED",
            ErrorCode::ConnectionLimit => "CONNECTION_LIMIT",
            ErrorCode::AdminRequired => "ADMIN_REQUIRED",
            ErrorCode::UnknownSession => "UNKNOWN_SESSION",
            ErrorCode::EventNotAllowed => "EVENT_NOT_ALLOWED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::CsrfFailed => "CSRF_FAILED",
            ErrorCode::AbuseDetected => "ABUSE_DETECTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化错误响应（下发给远端客户端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 时间戳
    pub timestamp: u64,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}
