/// 外部协作方接口
///
/// 安全引擎不负责身份存储、CSRF 签名、输入净化的具体规则和审计落盘，
/// 这些由宿主服务实现，引擎只通过这里定义的 trait 调用。
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// 安全事件严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// 事件类型（如 connection_rejected / abuse_detected）
    pub event_type: String,
    /// 严重级别
    pub severity: Severity,
    /// 关联用户（可能未认证）
    pub user_id: Option<u64>,
    /// 来源 IP
    pub ip: Option<String>,
    /// 详情（仅供审计，不下发客户端）
    pub details: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        event_type: impl Into<String>,
        severity: Severity,
        user_id: Option<u64>,
        ip: Option<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            severity,
            user_id,
            ip,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 会话数据（由宿主的会话系统解析）
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    /// 用户 ID（未认证时为 None）
    pub user_id: Option<u64>,
    /// 设备 ID
    pub device_id: Option<String>,
}

/// 会话查询：从不透明的会话令牌解析身份
pub trait SessionLookup: Send + Sync {
    fn session_data(&self, auth_token: &str) -> Result<SessionData>;
}

/// 用户目录：权限查询
pub trait UserDirectory: Send + Sync {
    fn is_admin(&self, user_id: u64) -> bool;
}

/// CSRF 令牌校验
pub trait CsrfValidator: Send + Sync {
    fn validate_token(&self, token: &str, user_id: Option<u64>, operation: &str) -> bool;
}

/// 单字段净化规则
#[derive(Debug, Clone)]
pub struct FieldRules {
    /// 最大长度（字符数）
    pub max_len: usize,
    /// 是否允许 HTML
    pub allow_html: bool,
    /// 是否跳过恶意内容启发式检查（如 csrf_token 这类随机串）
    pub skip_malicious_check: bool,
}

impl Default for FieldRules {
    fn default() -> Self {
        Self {
            max_len: 1000,
            allow_html: false,
            skip_malicious_check: false,
        }
    }
}

/// 字段净化失败
#[derive(Debug, Clone, thiserror::Error)]
#[error("field '{field}' rejected: {reason}")]
pub struct SanitizeError {
    pub field: String,
    pub reason: String,
}

/// 输入净化器：按字段规则校验并净化
pub trait InputSanitizer: Send + Sync {
    fn sanitize_field(
        &self,
        name: &str,
        value: &str,
        rules: &FieldRules,
    ) -> std::result::Result<String, SanitizeError>;
}

/// 审计事件接收端（热路径调用，绝不允许阻塞）
pub trait SecurityAuditSink: Send + Sync {
    fn log_security_event(&self, record: AuditRecord);
}

/// 审计后端（真正的持久化，异步、带外）
#[async_trait]
pub trait AuditBackend: Send + Sync {
    async fn write_event(&self, record: AuditRecord);
}

/// 管理员告警通道
pub trait NotificationChannel: Send + Sync {
    fn alert(&self, message: &str, severity: Severity);
}

/// 传输层关闭信号：通知宿主关闭指定会话的底层 socket
pub trait ConnectionCloser: Send + Sync {
    fn close(&self, session_id: &str, reason: &str);
}

/// 默认关闭器：只打日志，不做事（用于测试和未接线的场景）
pub struct NoopCloser;

impl ConnectionCloser for NoopCloser {
    fn close(&self, session_id: &str, reason: &str) {
        debug!("关闭会话 {}（未接传输层）: {}", session_id, reason);
    }
}

/// 带缓冲的审计接收端
///
/// 把同步的 `SecurityAuditSink` 调用转成异步后端写入：
/// 热路径只做一次 try_send，通道满了就丢弃并计数，绝不阻塞。
pub struct BufferedAuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: AtomicU64,
}

impl BufferedAuditSink {
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// 启动缓冲接收端和后台排水任务（需要在 tokio 运行时内调用）
    pub fn spawn(backend: Arc<dyn AuditBackend>) -> Arc<Self> {
        Self::spawn_with_capacity(backend, Self::DEFAULT_CAPACITY)
    }

    pub fn spawn_with_capacity(backend: Arc<dyn AuditBackend>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                backend.write_event(record).await;
            }
            debug!("审计排水任务退出");
        });

        Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// 因通道满而丢弃的事件数
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SecurityAuditSink for BufferedAuditSink {
    fn log_security_event(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!("审计通道已满，累计丢弃 {} 条事件", dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct MemoryBackend {
        records: Mutex<Vec<AuditRecord>>,
    }

    #[async_trait]
    impl AuditBackend for MemoryBackend {
        async fn write_event(&self, record: AuditRecord) {
            self.records.lock().push(record);
        }
    }

    #[tokio::test]
    async fn test_buffered_sink_delivers() {
        let backend = Arc::new(MemoryBackend {
            records: Mutex::new(Vec::new()),
        });
        let sink = BufferedAuditSink::spawn(backend.clone() as Arc<dyn AuditBackend>);

        sink.log_security_event(AuditRecord::new(
            "test_event",
            Severity::Low,
            Some(1),
            Some("10.0.0.1".to_string()),
            "hello",
        ));

        // 等排水任务消费
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let records = backend.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "test_event");
    }

    #[tokio::test]
    async fn test_buffered_sink_drops_when_full() {
        // 后端永远不消费：用一个挂起的 backend
        struct StuckBackend;

        #[async_trait]
        impl AuditBackend for StuckBackend {
            async fn write_event(&self, _record: AuditRecord) {
                std::future::pending::<()>().await;
            }
        }

        let sink = BufferedAuditSink::spawn_with_capacity(Arc::new(StuckBackend), 2);
        for _ in 0..10 {
            sink.log_security_event(AuditRecord::new("flood", Severity::Low, None, None, ""));
        }
        // 容量 2 + 正在被 write_event 占用的 1 条，其余必然被丢弃
        assert!(sink.dropped_count() >= 7);
    }
}
