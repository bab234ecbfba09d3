/// 滥用模式检测引擎
///
/// 对连接 / 消息 / 认证三类信号维护滚动指标，
/// 按一组声明式规则独立评估（规则之间不互斥，一个事件可能触发多条），
/// 并执行配置的响应动作：记录 → 软限流 → 临时封禁 → 断开 → 长期封禁。
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AbuseConfig;
use crate::external::{AuditRecord, NotificationChannel, SecurityAuditSink, Severity};
use crate::security::block::{BlockKey, BlockStore};
use crate::security::rate_limiter::RateLimiter;

/// 单个指标集合的时间戳上限，防止窗口内被刷爆内存
const MAX_TRACKED_EVENTS: usize = 4096;
/// 消息体大小环形缓冲容量
const PAYLOAD_RING_CAP: usize = 64;
/// 事件类型集合容量上限
const MAX_EVENT_TYPES: usize = 64;
/// 去重时从历史尾部回溯扫描的条数上限
const ACTIVE_SCAN_LIMIT: usize = 256;

/// 滥用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbuseType {
    /// 连接洪泛
    ConnectionFlood,
    /// 快速重连
    RapidReconnection,
    /// 消息洪泛
    MessageFlood,
    /// 资源耗尽（连续大消息体）
    ResourceExhaustion,
    /// 恶意注入（持续校验失败）
    MaliciousInjection,
    /// 认证滥用（撞库 / 爆破）
    AuthenticationAbuse,
}

impl AbuseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseType::ConnectionFlood => "CONNECTION_FLOOD",
            AbuseType::RapidReconnection => "RAPID_RECONNECTION",
            AbuseType::MessageFlood => "MESSAGE_FLOOD",
            AbuseType::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            AbuseType::MaliciousInjection => "MALICIOUS_INJECTION",
            AbuseType::AuthenticationAbuse => "AUTHENTICATION_ABUSE",
        }
    }
}

/// 响应动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseAction {
    /// 仅记录
    LogOnly,
    /// 软限流：把对应限流 key 置为已耗尽
    RateLimit,
    /// 临时封禁（时长见 AbuseConfig::temp_ban_secs）
    TemporaryBan,
    /// 立即断开该会话
    Disconnect,
    /// 长期封禁（所谓"永久"只是一条很长的临时封禁）
    PermanentBan,
    /// 通知管理员
    AlertAdmin,
}

/// 声明式滥用规则（启动时配置，运行期不可变）
#[derive(Debug, Clone)]
pub struct AbusePattern {
    pub name: String,
    pub abuse_type: AbuseType,
    /// 计数阈值
    pub threshold: u32,
    /// 时间窗口
    pub time_window: Duration,
    pub action: AbuseAction,
    pub severity: Severity,
    pub enabled: bool,
}

impl AbusePattern {
    fn new(
        name: &str,
        abuse_type: AbuseType,
        threshold: u32,
        window_secs: u64,
        action: AbuseAction,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.to_string(),
            abuse_type,
            threshold,
            time_window: Duration::from_secs(window_secs),
            action,
            severity,
            enabled: true,
        }
    }
}

/// 默认规则集
pub fn default_patterns() -> Vec<AbusePattern> {
    vec![
        AbusePattern::new(
            "connection_flood",
            AbuseType::ConnectionFlood,
            20,
            60,
            AbuseAction::TemporaryBan,
            Severity::High,
        ),
        AbusePattern::new(
            "rapid_reconnection",
            AbuseType::RapidReconnection,
            10,
            300,
            AbuseAction::RateLimit,
            Severity::Medium,
        ),
        AbusePattern::new(
            "message_flood",
            AbuseType::MessageFlood,
            100,
            60,
            AbuseAction::RateLimit,
            Severity::Medium,
        ),
        AbusePattern::new(
            "resource_exhaustion",
            AbuseType::ResourceExhaustion,
            5,
            300,
            AbuseAction::Disconnect,
            Severity::High,
        ),
        AbusePattern::new(
            "malicious_injection",
            AbuseType::MaliciousInjection,
            10,
            600,
            AbuseAction::TemporaryBan,
            Severity::Critical,
        ),
        AbusePattern::new(
            "authentication_abuse",
            AbuseType::AuthenticationAbuse,
            5,
            300,
            AbuseAction::Disconnect,
            Severity::High,
        ),
    ]
}

/// 滥用事件（追加审计记录，保留在有界滚动历史里）
#[derive(Debug, Clone, Serialize)]
pub struct AbuseEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub abuse_type: AbuseType,
    pub session_id: Option<String>,
    pub user_id: Option<u64>,
    pub ip: Option<String>,
    pub details: String,
    pub severity: Severity,
    pub action_taken: AbuseAction,
    /// 去重计数：活跃期内同规则同主体重复触发只累加该值
    pub count: u32,
}

/// 一次观察的裁决结果
#[derive(Debug, Clone, Default)]
pub struct AbuseVerdict {
    /// 本次触发的规则
    pub triggered: Vec<AbuseType>,
    /// 是否需要立即断开该会话（由 SecurityGateway 执行）
    pub disconnect: bool,
}

impl AbuseVerdict {
    pub fn is_clean(&self) -> bool {
        self.triggered.is_empty()
    }
}

#[derive(Debug)]
struct IpMetrics {
    connection_attempts: VecDeque<Instant>,
    last_seen: Instant,
}

impl IpMetrics {
    fn new(now: Instant) -> Self {
        Self {
            connection_attempts: VecDeque::new(),
            last_seen: now,
        }
    }
}

#[derive(Debug)]
struct SessionMetrics {
    first_connect: Instant,
    reconnections: u32,
    message_times: VecDeque<Instant>,
    large_payload_times: VecDeque<Instant>,
    payload_sizes: VecDeque<usize>,
    auth_failures: VecDeque<Instant>,
    validation_failures: VecDeque<Instant>,
    event_types: HashSet<String>,
    last_seen: Instant,
}

impl SessionMetrics {
    fn new(now: Instant) -> Self {
        Self {
            first_connect: now,
            reconnections: 0,
            message_times: VecDeque::new(),
            large_payload_times: VecDeque::new(),
            payload_sizes: VecDeque::new(),
            auth_failures: VecDeque::new(),
            validation_failures: VecDeque::new(),
            event_types: HashSet::new(),
            last_seen: now,
        }
    }
}

fn push_bounded(times: &mut VecDeque<Instant>, now: Instant) {
    if times.len() >= MAX_TRACKED_EVENTS {
        times.pop_front();
    }
    times.push_back(now);
}

fn count_in_window(times: &mut VecDeque<Instant>, window: Duration, now: Instant) -> u32 {
    while let Some(&t) = times.front() {
        if now.saturating_duration_since(t) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
    times.len() as u32
}

fn component_for(abuse_type: AbuseType, session_id: Option<&str>, ip: Option<&str>) -> String {
    match abuse_type {
        AbuseType::ConnectionFlood | AbuseType::RapidReconnection => {
            ip.or(session_id).unwrap_or("").to_string()
        }
        _ => session_id.or(ip).unwrap_or("").to_string(),
    }
}

struct EngineState {
    ips: HashMap<String, IpMetrics>,
    sessions: HashMap<String, SessionMetrics>,
    events: VecDeque<AbuseEvent>,
}

/// 引擎统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct AbuseEngineStats {
    pub tracked_ips: usize,
    pub tracked_sessions: usize,
    pub event_history_len: usize,
    pub total_triggers: u64,
}

/// 滥用模式检测引擎
pub struct AbusePatternEngine {
    patterns: Vec<AbusePattern>,
    config: AbuseConfig,
    state: Mutex<EngineState>,
    rate_limiter: Arc<RateLimiter>,
    blocks: Arc<BlockStore>,
    audit: Arc<dyn SecurityAuditSink>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    total_triggers: AtomicU64,
}

impl AbusePatternEngine {
    pub fn new(
        config: AbuseConfig,
        rate_limiter: Arc<RateLimiter>,
        blocks: Arc<BlockStore>,
        audit: Arc<dyn SecurityAuditSink>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self::with_patterns(
            default_patterns(),
            config,
            rate_limiter,
            blocks,
            audit,
            notifier,
        )
    }

    pub fn with_patterns(
        patterns: Vec<AbusePattern>,
        config: AbuseConfig,
        rate_limiter: Arc<RateLimiter>,
        blocks: Arc<BlockStore>,
        audit: Arc<dyn SecurityAuditSink>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            patterns,
            config,
            state: Mutex::new(EngineState {
                ips: HashMap::new(),
                sessions: HashMap::new(),
                events: VecDeque::new(),
            }),
            rate_limiter,
            blocks,
            audit,
            notifier,
            total_triggers: AtomicU64::new(0),
        }
    }

    fn pattern(&self, abuse_type: AbuseType) -> Option<&AbusePattern> {
        self.patterns
            .iter()
            .find(|p| p.abuse_type == abuse_type && p.enabled)
    }

    /// 观察一次连接尝试（成功建连和被限流拒绝的尝试都要喂进来，
    /// 拒绝不是静默丢弃——它们恰恰是洪泛的信号）
    pub fn observe_connection(
        &self,
        session_id: Option<&str>,
        user_id: Option<u64>,
        ip: &str,
    ) -> AbuseVerdict {
        self.observe_connection_at(session_id, user_id, ip, Instant::now())
    }

    pub fn observe_connection_at(
        &self,
        session_id: Option<&str>,
        user_id: Option<u64>,
        ip: &str,
        now: Instant,
    ) -> AbuseVerdict {
        let mut verdict = AbuseVerdict::default();
        let mut fired: Vec<(AbusePattern, String)> = Vec::new();
        {
            let mut state = self.state.lock();

            // IP 维度：连接洪泛
            if let Some(pattern) = self.pattern(AbuseType::ConnectionFlood) {
                let metrics = state
                    .ips
                    .entry(ip.to_string())
                    .or_insert_with(|| IpMetrics::new(now));
                metrics.last_seen = now;
                push_bounded(&mut metrics.connection_attempts, now);
                let attempts = count_in_window(
                    &mut metrics.connection_attempts,
                    pattern.time_window,
                    now,
                );
                // 阈值即额度：严格超出才算洪泛（第 threshold 次还是正常流量）
                if attempts > pattern.threshold {
                    fired.push((
                        pattern.clone(),
                        format!("{} connection attempts within window", attempts),
                    ));
                }
            }

            // 会话维度：快速重连（同一 session key 反复出现）
            //
            // 会话指标在断开后仍然保留（由 cleanup_old_data 按空闲回收），
            // 否则连接-断开-重连的循环每轮都会拿到全新的计数。
            if let (Some(sid), Some(pattern)) =
                (session_id, self.pattern(AbuseType::RapidReconnection))
            {
                let seen_before = state.sessions.contains_key(sid);
                let metrics = state
                    .sessions
                    .entry(sid.to_string())
                    .or_insert_with(|| SessionMetrics::new(now));
                if seen_before {
                    metrics.reconnections += 1;
                    metrics.last_seen = now;
                }
                let within_window =
                    now.saturating_duration_since(metrics.first_connect) <= pattern.time_window;
                if within_window && metrics.reconnections >= pattern.threshold {
                    fired.push((pattern.clone(), "session reconnecting rapidly".to_string()));
                }
            }

            for (pattern, details) in &fired {
                self.record_event(&mut state, pattern, session_id, user_id, Some(ip), details);
            }
        }

        for (pattern, details) in &fired {
            self.apply_pattern(pattern, session_id, user_id, Some(ip), details, &mut verdict);
        }

        verdict
    }

    /// 观察一条入站消息
    pub fn observe_message(
        &self,
        session_id: &str,
        user_id: Option<u64>,
        ip: &str,
        event_type: &str,
        payload_size: usize,
        validation_failed: bool,
        csrf_failed: bool,
    ) -> AbuseVerdict {
        self.observe_message_at(
            session_id,
            user_id,
            ip,
            event_type,
            payload_size,
            validation_failed,
            csrf_failed,
            Instant::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn observe_message_at(
        &self,
        session_id: &str,
        user_id: Option<u64>,
        ip: &str,
        event_type: &str,
        payload_size: usize,
        validation_failed: bool,
        csrf_failed: bool,
        now: Instant,
    ) -> AbuseVerdict {
        let mut verdict = AbuseVerdict::default();
        // 锁内只做指标更新和评估，命中的规则在放锁之后统一执行
        let mut fired: Vec<(AbusePattern, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            let metrics = state
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionMetrics::new(now));
            metrics.last_seen = now;
            push_bounded(&mut metrics.message_times, now);
            if metrics.event_types.len() < MAX_EVENT_TYPES {
                metrics.event_types.insert(event_type.to_string());
            }
            if metrics.payload_sizes.len() >= PAYLOAD_RING_CAP {
                metrics.payload_sizes.pop_front();
            }
            metrics.payload_sizes.push_back(payload_size);

            // 消息洪泛
            if let Some(pattern) = self.pattern(AbuseType::MessageFlood) {
                let count = count_in_window(&mut metrics.message_times, pattern.time_window, now);
                if count > pattern.threshold {
                    fired.push((
                        pattern.clone(),
                        format!("{} messages within window", count),
                    ));
                }
            }

            // 资源耗尽：窗口内连续大消息体
            if payload_size > self.config.large_payload_bytes {
                if let Some(pattern) = self.pattern(AbuseType::ResourceExhaustion) {
                    push_bounded(&mut metrics.large_payload_times, now);
                    let count =
                        count_in_window(&mut metrics.large_payload_times, pattern.time_window, now);
                    if count >= pattern.threshold {
                        fired.push((
                            pattern.clone(),
                            format!("{} oversized payloads ({} bytes last)", count, payload_size),
                        ));
                    }
                }
            }

            // 恶意注入：持续校验失败
            if validation_failed || csrf_failed {
                if let Some(pattern) = self.pattern(AbuseType::MaliciousInjection) {
                    push_bounded(&mut metrics.validation_failures, now);
                    let count =
                        count_in_window(&mut metrics.validation_failures, pattern.time_window, now);
                    if count >= pattern.threshold {
                        fired.push((
                            pattern.clone(),
                            format!("{} validation failures within window", count),
                        ));
                    }
                }
            }

            for (pattern, details) in &fired {
                self.record_event(
                    &mut state,
                    pattern,
                    Some(session_id),
                    user_id,
                    Some(ip),
                    details,
                );
            }
        }

        for (pattern, details) in &fired {
            self.apply_pattern(
                pattern,
                Some(session_id),
                user_id,
                Some(ip),
                details,
                &mut verdict,
            );
        }

        verdict
    }

    /// 观察一次认证失败
    pub fn observe_auth_failure(
        &self,
        session_id: &str,
        user_id: Option<u64>,
        ip: &str,
    ) -> AbuseVerdict {
        self.observe_auth_failure_at(session_id, user_id, ip, Instant::now())
    }

    pub fn observe_auth_failure_at(
        &self,
        session_id: &str,
        user_id: Option<u64>,
        ip: &str,
        now: Instant,
    ) -> AbuseVerdict {
        let mut verdict = AbuseVerdict::default();
        let mut fired: Vec<(AbusePattern, String)> = Vec::new();
        {
            let mut state = self.state.lock();

            if let Some(pattern) = self.pattern(AbuseType::AuthenticationAbuse) {
                let metrics = state
                    .sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| SessionMetrics::new(now));
                metrics.last_seen = now;
                push_bounded(&mut metrics.auth_failures, now);
                let count = count_in_window(&mut metrics.auth_failures, pattern.time_window, now);
                if count >= pattern.threshold {
                    fired.push((
                        pattern.clone(),
                        format!("{} failed auth attempts within window", count),
                    ));
                }
            }

            for (pattern, details) in &fired {
                self.record_event(
                    &mut state,
                    pattern,
                    Some(session_id),
                    user_id,
                    Some(ip),
                    details,
                );
            }
        }

        for (pattern, details) in &fired {
            self.apply_pattern(
                pattern,
                Some(session_id),
                user_id,
                Some(ip),
                details,
                &mut verdict,
            );
        }

        verdict
    }

    /// 规则命中的锁内部分：去重并写入事件历史
    fn record_event(
        &self,
        state: &mut EngineState,
        pattern: &AbusePattern,
        session_id: Option<&str>,
        user_id: Option<u64>,
        ip: Option<&str>,
        details: &str,
    ) {
        self.total_triggers.fetch_add(1, Ordering::Relaxed);

        // 主体标识按规则维度取：IP 维度的规则按 IP 去重，其余按会话
        let component = component_for(pattern.abuse_type, session_id, ip);

        // 去重：活跃期内同规则同主体只累加计数、刷新时间戳
        let now_utc = Utc::now();
        let window = chrono::Duration::from_std(pattern.time_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut deduped = false;
        for event in state.events.iter_mut().rev().take(ACTIVE_SCAN_LIMIT) {
            let same_component = component_for(
                event.abuse_type,
                event.session_id.as_deref(),
                event.ip.as_deref(),
            ) == component;
            if event.abuse_type == pattern.abuse_type
                && same_component
                && now_utc - event.timestamp < window
            {
                event.count += 1;
                event.timestamp = now_utc;
                event.details = details.to_string();
                deduped = true;
                break;
            }
        }

        if !deduped {
            warn!(
                "🚨 触发滥用规则 {}: session={:?} ip={:?} - {}",
                pattern.name, session_id, ip, details
            );
            state.events.push_back(AbuseEvent {
                id: Uuid::new_v4(),
                timestamp: now_utc,
                abuse_type: pattern.abuse_type,
                session_id: session_id.map(|s| s.to_string()),
                user_id,
                ip: ip.map(|s| s.to_string()),
                details: details.to_string(),
                severity: pattern.severity,
                action_taken: pattern.action,
                count: 1,
            });
        } else {
            debug!("滥用规则 {} 重复触发，已合并计数", pattern.name);
        }
    }

    /// 规则命中的锁外部分：发审计、告警、执行动作
    ///
    /// 审计和告警都是外部实现，不允许占着引擎状态锁调用它们。
    fn apply_pattern(
        &self,
        pattern: &AbusePattern,
        session_id: Option<&str>,
        user_id: Option<u64>,
        ip: Option<&str>,
        details: &str,
        verdict: &mut AbuseVerdict,
    ) {
        if !verdict.triggered.contains(&pattern.abuse_type) {
            verdict.triggered.push(pattern.abuse_type);
        }

        self.audit.log_security_event(AuditRecord::new(
            "abuse_detected",
            pattern.severity,
            user_id,
            ip.map(|s| s.to_string()),
            format!("{}: {}", pattern.abuse_type.as_str(), details),
        ));

        self.execute_action(pattern, session_id, user_id, ip, details, verdict);
    }

    fn execute_action(
        &self,
        pattern: &AbusePattern,
        session_id: Option<&str>,
        user_id: Option<u64>,
        ip: Option<&str>,
        details: &str,
        verdict: &mut AbuseVerdict,
    ) {
        match pattern.action {
            AbuseAction::LogOnly => {}
            AbuseAction::RateLimit => {
                // 软限流：把触发方的限流 key 置为已耗尽
                let (operation, identifier) = match pattern.abuse_type {
                    AbuseType::ConnectionFlood | AbuseType::RapidReconnection => {
                        ("connection", ip.map(|i| i.to_string()))
                    }
                    _ => (
                        "message",
                        user_id
                            .map(|u| format!("user_{}", u))
                            .or_else(|| session_id.map(|s| format!("session_{}", s))),
                    ),
                };
                if let Some(id) = identifier {
                    self.rate_limiter.exhaust(operation, &id);
                }
            }
            AbuseAction::TemporaryBan => {
                if let Some(ip) = ip {
                    self.blocks
                        .block(BlockKey::Ip(ip.to_string()), self.config.temp_ban());
                }
                if let Some(uid) = user_id {
                    self.blocks.block(BlockKey::User(uid), self.config.temp_ban());
                }
            }
            AbuseAction::Disconnect => {
                verdict.disconnect = true;
            }
            AbuseAction::PermanentBan => {
                if let Some(ip) = ip {
                    self.blocks
                        .block(BlockKey::Ip(ip.to_string()), self.config.permanent_ban());
                }
                if let Some(uid) = user_id {
                    self.blocks
                        .block(BlockKey::User(uid), self.config.permanent_ban());
                }
            }
            AbuseAction::AlertAdmin => {
                if let Some(notifier) = &self.notifier {
                    notifier.alert(
                        &format!("{}: {}", pattern.abuse_type.as_str(), details),
                        pattern.severity,
                    );
                }
            }
        }
    }

    /// 最近事件快照（新事件在后）
    pub fn recent_events(&self, limit: usize) -> Vec<AbuseEvent> {
        let state = self.state.lock();
        state
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// 清理过期事件与空闲指标（Janitor 调用）
    pub fn cleanup_old_data(&self) -> usize {
        self.cleanup_old_data_at(Instant::now(), Utc::now())
    }

    pub fn cleanup_old_data_at(&self, now: Instant, now_utc: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let retention = chrono::Duration::from_std(self.config.event_retention())
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        let before = state.events.len();
        while let Some(front) = state.events.front() {
            if now_utc - front.timestamp >= retention {
                state.events.pop_front();
            } else {
                break;
            }
        }
        let removed = before - state.events.len();

        // 指标按最长规则窗口的两倍回收
        let max_window = self
            .patterns
            .iter()
            .map(|p| p.time_window)
            .max()
            .unwrap_or(Duration::from_secs(600));
        let idle_cutoff = max_window * 2;
        state
            .ips
            .retain(|_, m| now.saturating_duration_since(m.last_seen) < idle_cutoff);
        state
            .sessions
            .retain(|_, m| now.saturating_duration_since(m.last_seen) < idle_cutoff);

        removed
    }

    pub fn stats(&self) -> AbuseEngineStats {
        let state = self.state.lock();
        AbuseEngineStats {
            tracked_ips: state.ips.len(),
            tracked_sessions: state.sessions.len(),
            event_history_len: state.events.len(),
            total_triggers: self.total_triggers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    struct NullSink;
    impl SecurityAuditSink for NullSink {
        fn log_security_event(&self, _record: AuditRecord) {}
    }

    fn engine() -> (AbusePatternEngine, Arc<BlockStore>, Arc<RateLimiter>) {
        let limiter = Arc::new(RateLimiter::from_config(&SecurityConfig::default()));
        let blocks = Arc::new(BlockStore::new());
        let engine = AbusePatternEngine::new(
            AbuseConfig::default(),
            limiter.clone(),
            blocks.clone(),
            Arc::new(NullSink),
            None,
        );
        (engine, blocks, limiter)
    }

    #[test]
    fn test_connection_flood_bans_ip() {
        let (engine, blocks, _) = engine();
        let base = Instant::now();

        // 阈值 20：第 20 次还不触发，第 21 次触发
        for i in 0..20 {
            let sid = format!("s{}", i);
            let verdict = engine.observe_connection_at(Some(&sid), None, "10.0.0.1", base);
            assert!(verdict.is_clean(), "第 {} 次不应触发", i + 1);
        }
        let verdict = engine.observe_connection_at(Some("s20"), None, "10.0.0.1", base);
        assert!(verdict.triggered.contains(&AbuseType::ConnectionFlood));
        assert!(blocks.is_blocked(&BlockKey::Ip("10.0.0.1".to_string())));
    }

    #[test]
    fn test_connection_flood_window_slides() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        for i in 0..20 {
            engine.observe_connection_at(Some("s"), None, "10.0.0.2", base);
            let _ = i;
        }
        // 窗口（60s）滑过之后重新计数
        let later = base + Duration::from_secs(61);
        let verdict = engine.observe_connection_at(Some("s"), None, "10.0.0.2", later);
        assert!(!verdict.triggered.contains(&AbuseType::ConnectionFlood));
    }

    #[test]
    fn test_rapid_reconnection() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        // 同一 session key 在窗口内反复出现：第 11 次时 reconnections = 10
        let mut triggered = false;
        for i in 0..11 {
            let now = base + Duration::from_secs(i);
            let verdict = engine.observe_connection_at(Some("sticky"), Some(1), "10.0.0.3", now);
            if verdict.triggered.contains(&AbuseType::RapidReconnection) {
                triggered = true;
            }
        }
        assert!(triggered);
    }

    #[test]
    fn test_message_flood() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        for i in 0..100 {
            let verdict =
                engine.observe_message_at("s1", Some(1), "10.0.0.1", "message", 10, false, false, base);
            assert!(
                !verdict.triggered.contains(&AbuseType::MessageFlood),
                "第 {} 条不应触发",
                i + 1
            );
        }
        let verdict =
            engine.observe_message_at("s1", Some(1), "10.0.0.1", "message", 10, false, false, base);
        assert!(verdict.triggered.contains(&AbuseType::MessageFlood));
    }

    #[test]
    fn test_resource_exhaustion_disconnects() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        // 5 条大消息体（> 5000 字节）触发断开
        let mut verdict = AbuseVerdict::default();
        for _ in 0..5 {
            verdict =
                engine.observe_message_at("s1", None, "10.0.0.1", "message", 6000, false, false, base);
        }
        assert!(verdict.triggered.contains(&AbuseType::ResourceExhaustion));
        assert!(verdict.disconnect);
    }

    #[test]
    fn test_malicious_injection_bans() {
        let (engine, blocks, _) = engine();
        let base = Instant::now();

        let mut verdict = AbuseVerdict::default();
        for _ in 0..10 {
            verdict =
                engine.observe_message_at("s1", Some(7), "10.0.0.1", "message", 10, true, false, base);
        }
        assert!(verdict.triggered.contains(&AbuseType::MaliciousInjection));
        assert!(blocks.is_blocked(&BlockKey::Ip("10.0.0.1".to_string())));
        assert!(blocks.is_blocked(&BlockKey::User(7)));
    }

    #[test]
    fn test_auth_abuse_disconnects() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        let mut verdict = AbuseVerdict::default();
        for i in 0..5 {
            verdict = engine.observe_auth_failure_at("s1", None, "10.0.0.1", base + Duration::from_secs(i));
        }
        assert!(verdict.triggered.contains(&AbuseType::AuthenticationAbuse));
        assert!(verdict.disconnect);
    }

    #[test]
    fn test_event_deduplication() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        // 持续洪泛：多次触发同一规则同一主体只产生一条事件，计数累加
        for i in 0..30 {
            engine.observe_connection_at(Some(&format!("s{}", i)), None, "10.0.0.1", base);
        }
        let events: Vec<_> = engine
            .recent_events(100)
            .into_iter()
            .filter(|e| e.abuse_type == AbuseType::ConnectionFlood)
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].count, 10); // 第 21..=30 次各计一次
    }

    #[test]
    fn test_rate_limit_action_exhausts_key() {
        let (engine, _, limiter) = engine();
        let base = Instant::now();

        // 消息洪泛触发软限流：user_1 的 message 额度被清空
        for _ in 0..101 {
            engine.observe_message_at("s1", Some(1), "10.0.0.1", "message", 10, false, false, base);
        }
        assert!(!limiter.check_limit_at("message", "user_1", base));
    }

    #[test]
    fn test_cleanup_prunes_events_and_metrics() {
        let (engine, _, _) = engine();
        let base = Instant::now();

        for i in 0..25 {
            engine.observe_connection_at(Some(&format!("s{}", i)), None, "10.0.0.1", base);
        }
        assert!(engine.stats().event_history_len > 0);
        assert!(engine.stats().tracked_ips > 0);

        let removed = engine.cleanup_old_data_at(
            base + Duration::from_secs(48 * 3600),
            Utc::now() + chrono::Duration::hours(25),
        );
        assert!(removed > 0);
        let stats = engine.stats();
        assert_eq!(stats.event_history_len, 0);
        assert_eq!(stats.tracked_ips, 0);
        assert_eq!(stats.tracked_sessions, 0);
    }

    #[test]
    fn test_disabled_pattern_never_fires() {
        let mut patterns = default_patterns();
        for p in &mut patterns {
            if p.abuse_type == AbuseType::ConnectionFlood {
                p.enabled = false;
            }
        }
        let limiter = Arc::new(RateLimiter::from_config(&SecurityConfig::default()));
        let blocks = Arc::new(BlockStore::new());
        let engine = AbusePatternEngine::with_patterns(
            patterns,
            AbuseConfig::default(),
            limiter,
            blocks.clone(),
            Arc::new(NullSink),
            None,
        );

        let base = Instant::now();
        for i in 0..50 {
            let verdict =
                engine.observe_connection_at(Some(&format!("s{}", i)), None, "10.0.0.1", base);
            assert!(!verdict.triggered.contains(&AbuseType::ConnectionFlood));
        }
        assert!(!blocks.is_blocked(&BlockKey::Ip("10.0.0.1".to_string())));
    }

    #[test]
    fn test_alert_runs_without_engine_lock() {
        use std::sync::atomic::AtomicUsize;

        // 告警通道回头查询引擎自身。状态锁不可重入，
        // 若 alert 在持锁期间被调用，这里会死锁而不是通过。
        struct ReentrantNotifier {
            engine: Mutex<Option<Arc<AbusePatternEngine>>>,
            alerts: AtomicUsize,
        }
        impl NotificationChannel for ReentrantNotifier {
            fn alert(&self, _message: &str, _severity: Severity) {
                if let Some(engine) = self.engine.lock().as_ref() {
                    let _ = engine.stats();
                }
                self.alerts.fetch_add(1, Ordering::SeqCst);
            }
        }

        let notifier = Arc::new(ReentrantNotifier {
            engine: Mutex::new(None),
            alerts: AtomicUsize::new(0),
        });
        let limiter = Arc::new(RateLimiter::from_config(&SecurityConfig::default()));
        let engine = Arc::new(AbusePatternEngine::with_patterns(
            vec![AbusePattern::new(
                "connection_flood",
                AbuseType::ConnectionFlood,
                2,
                60,
                AbuseAction::AlertAdmin,
                Severity::High,
            )],
            AbuseConfig::default(),
            limiter,
            Arc::new(BlockStore::new()),
            Arc::new(NullSink),
            Some(notifier.clone()),
        ));
        *notifier.engine.lock() = Some(engine.clone());

        let base = Instant::now();
        for i in 0..5 {
            engine.observe_connection_at(Some(&format!("s{}", i)), None, "10.0.0.1", base);
        }
        assert!(notifier.alerts.load(Ordering::SeqCst) >= 1);
    }
}
