/// 安全网关
///
/// 连接处理层的唯一入口：组合限流器、连接注册表、滥用引擎、封禁表
/// 和外部协作方（会话查询 / CSRF / 输入净化 / 审计），
/// 对新连接和入站消息做全链路检查并执行响应动作。
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SecurityConfig;
use crate::error::ErrorCode;
use crate::external::{
    AuditRecord, ConnectionCloser, CsrfValidator, FieldRules, InputSanitizer, NotificationChannel,
    SecurityAuditSink, SessionLookup, Severity, UserDirectory,
};
use crate::security::abuse::{AbuseEngineStats, AbusePatternEngine, AbuseVerdict};
use crate::security::block::{BlockKey, BlockStore};
use crate::security::rate_limiter::{resolve_identifier, RateLimiter, RateLimiterStats};
use crate::security::registry::{ConnectionInfo, ConnectionRegistry};

/// 新连接请求（IP / UA 由传输层解析好传入）
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session_id: String,
    pub auth_token: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub namespace: String,
}

/// 连接检查结果
#[derive(Debug, Clone)]
pub struct ConnectionVerdict {
    pub allowed: bool,
    /// 拒绝原因（短小、机器可读，不含内部状态）
    pub reason: Option<String>,
    pub code: Option<ErrorCode>,
    pub info: Option<ConnectionInfo>,
}

impl ConnectionVerdict {
    fn allow(info: ConnectionInfo) -> Self {
        Self {
            allowed: true,
            reason: None,
            code: None,
            info: Some(info),
        }
    }

    fn deny(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            code: Some(code),
            info: None,
        }
    }
}

/// 消息检查结果
#[derive(Debug, Clone)]
pub struct MessageVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub code: Option<ErrorCode>,
    /// 净化后的消息体（仅放行时存在）
    pub sanitized: Option<Value>,
}

impl MessageVerdict {
    fn allow(sanitized: Value) -> Self {
        Self {
            allowed: true,
            reason: None,
            code: None,
            sanitized: Some(sanitized),
        }
    }

    fn deny(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            code: Some(code),
            sanitized: None,
        }
    }
}

/// 外部协作方集合
pub struct GatewayCollaborators {
    pub sessions: Arc<dyn SessionLookup>,
    pub users: Arc<dyn UserDirectory>,
    pub csrf: Arc<dyn CsrfValidator>,
    pub sanitizer: Arc<dyn InputSanitizer>,
    pub audit: Arc<dyn SecurityAuditSink>,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
    pub closer: Arc<dyn ConnectionCloser>,
}

/// 清理汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub evicted_sessions: usize,
    pub removed_rate_keys: usize,
    pub removed_abuse_events: usize,
    pub removed_blocks: usize,
}

/// 配置回显（只读快照用）
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub max_connections_per_ip: usize,
    pub max_connections_per_user: usize,
    pub max_message_size: usize,
    pub connection_timeout_secs: u64,
    pub fail_open_on_unresolved_identity: bool,
}

/// 运行状态快照（监控面板用，无副作用）
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub active_connections: usize,
    pub total_violations: u64,
    pub blocked_keys: usize,
    pub rate_limiter: RateLimiterStats,
    pub abuse: AbuseEngineStats,
    pub config: ConfigSnapshot,
}

/// 安全网关：每个进程构造一个实例，显式注入依赖
pub struct SecurityGateway {
    config: SecurityConfig,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<ConnectionRegistry>,
    abuse: Arc<AbusePatternEngine>,
    blocks: Arc<BlockStore>,
    sessions: Arc<dyn SessionLookup>,
    users: Arc<dyn UserDirectory>,
    csrf: Arc<dyn CsrfValidator>,
    sanitizer: Arc<dyn InputSanitizer>,
    audit: Arc<dyn SecurityAuditSink>,
    closer: Arc<dyn ConnectionCloser>,
}

impl SecurityGateway {
    pub fn new(config: SecurityConfig, collaborators: GatewayCollaborators) -> Self {
        let rate_limiter = Arc::new(RateLimiter::from_config(&config));
        let blocks = Arc::new(BlockStore::new());
        let abuse = Arc::new(AbusePatternEngine::new(
            config.abuse.clone(),
            rate_limiter.clone(),
            blocks.clone(),
            collaborators.audit.clone(),
            collaborators.notifier.clone(),
        ));

        Self {
            config,
            rate_limiter,
            registry: Arc::new(ConnectionRegistry::new()),
            abuse,
            blocks,
            sessions: collaborators.sessions,
            users: collaborators.users,
            csrf: collaborators.csrf,
            sanitizer: collaborators.sanitizer,
            audit: collaborators.audit,
            closer: collaborators.closer,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn abuse_engine(&self) -> &AbusePatternEngine {
        &self.abuse
    }

    fn emit(
        &self,
        event_type: &str,
        severity: Severity,
        user_id: Option<u64>,
        ip: &str,
        details: impl Into<String>,
    ) {
        self.audit.log_security_event(AuditRecord::new(
            event_type,
            severity,
            user_id,
            Some(ip.to_string()),
            details,
        ));
    }

    /// 记一次违规；累计数恰好达到可疑阈值时补一条 HIGH 审计
    fn note_violation(&self, session_id: &str, user_id: Option<u64>, ip: &str) {
        if let Some(count) = self.registry.record_violation(session_id) {
            if count == self.config.suspicious_activity_threshold {
                self.emit(
                    "suspicious_activity",
                    Severity::High,
                    user_id,
                    ip,
                    format!("session {} accumulated {} violations", session_id, count),
                );
            }
        }
    }

    /// 校验新连接
    ///
    /// 检查顺序：身份解析 → 封禁表 → 连接限流 → 并发上限 → 命名空间权限。
    /// 策略类拒绝记 HIGH，纯限流拒绝记 MEDIUM。
    pub fn validate_connection(&self, req: &ConnectRequest) -> ConnectionVerdict {
        // 1. 身份解析（内部错误按配置 fail-open / fail-closed）
        let mut user_id = None;
        if let Some(token) = &req.auth_token {
            match self.sessions.session_data(token) {
                Ok(data) => user_id = data.user_id,
                Err(err) => {
                    warn!("会话解析失败: {}", err);
                    if !self.config.fail_open_on_unresolved_identity {
                        self.emit(
                            "connection_rejected",
                            Severity::High,
                            None,
                            &req.ip,
                            "identity resolution failed (fail-closed)",
                        );
                        return ConnectionVerdict::deny(
                            ErrorCode::Internal,
                            "Identity verification failed",
                        );
                    }
                    // fail-open：继续按匿名连接处理
                }
            }
        }

        // 2. 封禁表（策略检查，fail closed）
        let ip_key = BlockKey::Ip(req.ip.clone());
        let user_blocked = user_id
            .map(|uid| self.blocks.is_blocked(&BlockKey::User(uid)))
            .unwrap_or(false);
        if self.blocks.is_blocked(&ip_key) || user_blocked {
            self.emit(
                "connection_rejected",
                Severity::High,
                user_id,
                &req.ip,
                "source is blocked",
            );
            return ConnectionVerdict::deny(ErrorCode::Blocked, "Connection blocked");
        }

        // 3. 连接限流（按 IP）
        if !self.rate_limiter.check_limit("connection", &req.ip) {
            self.emit(
                "connection_rate_limited",
                Severity::Medium,
                user_id,
                &req.ip,
                "connection rate limit exceeded",
            );
            // 被拒绝的尝试同样要喂给滥用引擎：洪泛恰恰由它们构成
            self.abuse.observe_connection(None, user_id, &req.ip);
            return ConnectionVerdict::deny(
                ErrorCode::RateLimitExceeded,
                "Connection rate limit exceeded",
            );
        }

        // 4. 并发连接上限
        if self.registry.count_by_ip(&req.ip) >= self.config.max_connections_per_ip {
            self.emit(
                "connection_rejected",
                Severity::High,
                user_id,
                &req.ip,
                "too many concurrent connections from ip",
            );
            return ConnectionVerdict::deny(
                ErrorCode::ConnectionLimit,
                "Too many connections from this IP",
            );
        }
        if let Some(uid) = user_id {
            if self.registry.count_by_user(uid) >= self.config.max_connections_per_user {
                self.emit(
                    "connection_rejected",
                    Severity::High,
                    user_id,
                    &req.ip,
                    "too many concurrent connections for user",
                );
                return ConnectionVerdict::deny(
                    ErrorCode::ConnectionLimit,
                    "Too many connections for this user",
                );
            }
        }

        // 5. 命名空间权限（策略检查，fail closed）
        let is_admin = user_id.map(|uid| self.users.is_admin(uid)).unwrap_or(false);
        if self.config.admin_namespaces.contains(&req.namespace) && !is_admin {
            self.emit(
                "connection_rejected",
                Severity::High,
                user_id,
                &req.ip,
                format!("namespace {} requires admin", req.namespace),
            );
            return ConnectionVerdict::deny(ErrorCode::AdminRequired, "Admin privileges required");
        }

        // 6. 放行：登记 + 喂给滥用引擎
        let mut info = ConnectionInfo::new(
            req.session_id.clone(),
            user_id,
            req.ip.clone(),
            req.user_agent.clone(),
            req.namespace.clone(),
        );
        info.is_admin = is_admin;
        self.registry.track(info.clone());

        let verdict = self
            .abuse
            .observe_connection(Some(&req.session_id), user_id, &req.ip);
        if let Some(denied) = self.enforce_disconnect(&verdict, &req.session_id, user_id, &req.ip) {
            return denied;
        }

        debug!("连接通过检查: {} ({})", req.session_id, req.ip);
        ConnectionVerdict::allow(info)
    }

    fn enforce_disconnect(
        &self,
        verdict: &AbuseVerdict,
        session_id: &str,
        user_id: Option<u64>,
        ip: &str,
    ) -> Option<ConnectionVerdict> {
        if verdict.disconnect && self.config.auto_disconnect_on_abuse {
            self.disconnect(session_id, "abuse detected");
            self.emit(
                "connection_rejected",
                Severity::High,
                user_id,
                ip,
                "disconnected by abuse rule",
            );
            return Some(ConnectionVerdict::deny(
                ErrorCode::AbuseDetected,
                "Connection closed due to abuse",
            ));
        }
        None
    }

    /// 校验入站消息
    ///
    /// 顺序固定：会话 → 活动时间 → 限流 → 事件白名单 → 体积上限 →
    /// 字段净化/CSRF → 滥用引擎。体积超限在净化之前拒绝，不浪费算力。
    pub fn validate_message(
        &self,
        session_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> MessageVerdict {
        // 1. 会话必须在册
        let Some(info) = self.registry.get(session_id) else {
            return MessageVerdict::deny(ErrorCode::UnknownSession, "Unknown session");
        };

        // 2. 更新活动时间
        self.registry.touch(session_id);

        let payload_size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);

        // 3. 消息限流（用户优先，匿名回退到会话）
        let identifier = resolve_identifier(None, info.user_id, None)
            .unwrap_or_else(|| format!("session_{}", session_id));
        if !self.rate_limiter.check_limit("message", &identifier) {
            self.note_violation(session_id, info.user_id, &info.ip);
            self.emit(
                "message_rate_limited",
                Severity::Medium,
                info.user_id,
                &info.ip,
                "message rate limit exceeded",
            );
            let verdict = self.abuse.observe_message(
                session_id,
                info.user_id,
                &info.ip,
                event_type,
                payload_size,
                false,
                false,
            );
            if verdict.disconnect && self.config.auto_disconnect_on_abuse {
                self.disconnect(session_id, "abuse detected");
            }
            return MessageVerdict::deny(
                ErrorCode::RateLimitExceeded,
                "Message rate limit exceeded",
            );
        }

        // 4. 事件类型白名单
        if !self.config.allowed_event_types.contains(event_type) {
            self.note_violation(session_id, info.user_id, &info.ip);
            self.emit(
                "message_rejected",
                Severity::High,
                info.user_id,
                &info.ip,
                format!("event type not allowed: {}", event_type),
            );
            let verdict = self.abuse.observe_message(
                session_id,
                info.user_id,
                &info.ip,
                event_type,
                payload_size,
                true,
                false,
            );
            if verdict.disconnect && self.config.auto_disconnect_on_abuse {
                self.disconnect(session_id, "abuse detected");
            }
            return MessageVerdict::deny(ErrorCode::EventNotAllowed, "Event type not allowed");
        }

        // 5. 体积上限（在净化之前）
        if payload_size > self.config.max_message_size {
            self.note_violation(session_id, info.user_id, &info.ip);
            self.emit(
                "message_rejected",
                Severity::Medium,
                info.user_id,
                &info.ip,
                format!(
                    "message too large: {} > {}",
                    payload_size, self.config.max_message_size
                ),
            );
            let verdict = self.abuse.observe_message(
                session_id,
                info.user_id,
                &info.ip,
                event_type,
                payload_size,
                false,
                false,
            );
            if verdict.disconnect && self.config.auto_disconnect_on_abuse {
                self.disconnect(session_id, "abuse detected");
            }
            return MessageVerdict::deny(ErrorCode::MessageTooLarge, "Message too large");
        }

        // 6. 字段净化 + CSRF
        let sanitized = match self.sanitize_payload(&info, session_id, event_type, payload) {
            Ok(value) => value,
            Err(verdict) => return verdict,
        };

        // 7. 滥用引擎
        let verdict = self.abuse.observe_message(
            session_id,
            info.user_id,
            &info.ip,
            event_type,
            payload_size,
            false,
            false,
        );
        if verdict.disconnect && self.config.auto_disconnect_on_abuse {
            self.disconnect(session_id, "abuse detected");
            return MessageVerdict::deny(ErrorCode::AbuseDetected, "Connection closed due to abuse");
        }

        MessageVerdict::allow(sanitized)
    }

    /// 按事件类型取字段规则
    fn field_rules(&self, event_type: &str, field: &str) -> FieldRules {
        match (event_type, field) {
            // csrf_token 是随机串，跳过恶意内容启发式，但仍限长
            (_, "csrf_token") => FieldRules {
                max_len: 256,
                allow_html: false,
                skip_malicious_check: true,
            },
            ("message", "content") => FieldRules {
                max_len: 5000,
                allow_html: false,
                skip_malicious_check: false,
            },
            _ => FieldRules::default(),
        }
    }

    fn sanitize_payload(
        &self,
        info: &ConnectionInfo,
        session_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<Value, MessageVerdict> {
        let Value::Object(map) = payload else {
            // 非对象消息体直接透传（体积已经校验过）
            return Ok(payload.clone());
        };

        // CSRF：状态变更类事件必须带合法令牌
        if self.config.csrf_protected_events.contains(event_type) {
            let token = map.get("csrf_token").and_then(|v| v.as_str());
            let valid = token
                .map(|t| self.csrf.validate_token(t, info.user_id, event_type))
                .unwrap_or(false);
            if !valid {
                self.note_violation(session_id, info.user_id, &info.ip);
                self.emit(
                    "message_rejected",
                    Severity::High,
                    info.user_id,
                    &info.ip,
                    "csrf validation failed",
                );
                let verdict = self.abuse.observe_message(
                    session_id,
                    info.user_id,
                    &info.ip,
                    event_type,
                    0,
                    false,
                    true,
                );
                if verdict.disconnect && self.config.auto_disconnect_on_abuse {
                    self.disconnect(session_id, "abuse detected");
                }
                return Err(MessageVerdict::deny(
                    ErrorCode::CsrfFailed,
                    "CSRF validation failed",
                ));
            }
        }

        let mut clean = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::String(text) => {
                    let rules = self.field_rules(event_type, key);
                    match self.sanitizer.sanitize_field(key, text, &rules) {
                        Ok(cleaned) => {
                            clean.insert(key.clone(), Value::String(cleaned));
                        }
                        Err(err) => {
                            // 净化器报错按拒绝处理（校验失败 fail closed）
                            self.note_violation(session_id, info.user_id, &info.ip);
                            self.emit(
                                "message_rejected",
                                Severity::Medium,
                                info.user_id,
                                &info.ip,
                                err.to_string(),
                            );
                            let verdict = self.abuse.observe_message(
                                session_id,
                                info.user_id,
                                &info.ip,
                                event_type,
                                0,
                                true,
                                false,
                            );
                            if verdict.disconnect && self.config.auto_disconnect_on_abuse {
                                self.disconnect(session_id, "abuse detected");
                            }
                            return Err(MessageVerdict::deny(
                                ErrorCode::ValidationFailed,
                                "Field validation failed",
                            ));
                        }
                    }
                }
                other => {
                    clean.insert(key.clone(), other.clone());
                }
            }
        }
        Ok(Value::Object(clean))
    }

    /// 记录一次认证失败并执行可能的响应动作
    pub fn record_auth_failure(&self, session_id: &str) {
        let (user_id, ip) = match self.registry.get(session_id) {
            Some(info) => (info.user_id, info.ip),
            None => (None, String::new()),
        };
        self.note_violation(session_id, user_id, &ip);
        let verdict = self.abuse.observe_auth_failure(session_id, user_id, &ip);
        if verdict.disconnect && self.config.auto_disconnect_on_abuse {
            self.disconnect(session_id, "authentication abuse");
        }
    }

    /// 断开指定会话（幂等：第二次调用是 no-op）
    ///
    /// 只注销连接登记，不清滥用指标——断开再重连拿不到新的违规预算。
    pub fn disconnect(&self, session_id: &str, reason: &str) -> bool {
        match self.registry.untrack(session_id) {
            Some(info) => {
                self.emit(
                    "connection_disconnected",
                    Severity::Medium,
                    info.user_id,
                    &info.ip,
                    reason,
                );
                self.closer.close(session_id, reason);
                info!("已断开会话 {}: {}", session_id, reason);
                true
            }
            None => {
                debug!("断开请求忽略（会话不存在）: {}", session_id);
                false
            }
        }
    }

    /// 全量清理（空闲连接 / 过期限流窗口 / 过期事件 / 过期封禁）
    pub fn cleanup_expired(&self) -> CleanupReport {
        let evicted = self.sweep_idle_connections();
        CleanupReport {
            evicted_sessions: evicted,
            removed_rate_keys: self.rate_limiter.cleanup(),
            removed_abuse_events: self.abuse.cleanup_old_data(),
            removed_blocks: self.blocks.evict_expired(),
        }
    }

    /// 子清扫：空闲连接（Janitor 单独调用，失败不影响其它子清扫）
    pub fn sweep_idle_connections(&self) -> usize {
        let evicted = self.registry.sweep(self.config.connection_timeout());
        for session_id in &evicted {
            self.closer.close(session_id, "idle timeout");
        }
        evicted.len()
    }

    /// 运行状态快照（只读，无副作用）
    pub fn security_stats(&self) -> SecurityStats {
        SecurityStats {
            active_connections: self.registry.len(),
            total_violations: self.registry.total_violations(),
            blocked_keys: self.blocks.len(),
            rate_limiter: self.rate_limiter.stats(),
            abuse: self.abuse.stats(),
            config: ConfigSnapshot {
                max_connections_per_ip: self.config.max_connections_per_ip,
                max_connections_per_user: self.config.max_connections_per_user,
                max_message_size: self.config.max_message_size,
                connection_timeout_secs: self.config.connection_timeout_secs,
                fail_open_on_unresolved_identity: self.config.fail_open_on_unresolved_identity,
            },
        }
    }
}
