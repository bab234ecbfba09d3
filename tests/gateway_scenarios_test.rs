//! 端到端场景测试：通过 SecurityGateway 的公开接口走完整链路。

use std::sync::Arc;

use parking_lot::Mutex;

use sockguard::{
    AbuseType, AuditRecord, BlockKey, ConnectRequest, ConnectionCloser, CsrfValidator, ErrorCode,
    FieldRules, GatewayCollaborators, InputSanitizer, SanitizeError, SecurityAuditSink,
    SecurityConfig, SecurityGateway, SessionData, SessionLookup, UserDirectory,
};

struct StaticSessions;
impl SessionLookup for StaticSessions {
    fn session_data(&self, auth_token: &str) -> sockguard::Result<SessionData> {
        let user_id = auth_token.strip_prefix("user:").and_then(|s| s.parse().ok());
        Ok(SessionData {
            user_id,
            device_id: None,
        })
    }
}

struct NoAdmins;
impl UserDirectory for NoAdmins {
    fn is_admin(&self, _user_id: u64) -> bool {
        false
    }
}

struct AcceptAllCsrf;
impl CsrfValidator for AcceptAllCsrf {
    fn validate_token(&self, _token: &str, _user_id: Option<u64>, _operation: &str) -> bool {
        true
    }
}

struct CountingSanitizer {
    calls: Mutex<usize>,
}
impl InputSanitizer for CountingSanitizer {
    fn sanitize_field(
        &self,
        _name: &str,
        value: &str,
        _rules: &FieldRules,
    ) -> Result<String, SanitizeError> {
        *self.calls.lock() += 1;
        Ok(value.to_string())
    }
}

struct CollectingSink {
    records: Mutex<Vec<AuditRecord>>,
}
impl SecurityAuditSink for CollectingSink {
    fn log_security_event(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

struct ClosedSessions {
    closed: Mutex<Vec<String>>,
}
impl ConnectionCloser for ClosedSessions {
    fn close(&self, session_id: &str, _reason: &str) {
        self.closed.lock().push(session_id.to_string());
    }
}

struct Harness {
    gateway: SecurityGateway,
    sanitizer: Arc<CountingSanitizer>,
    sink: Arc<CollectingSink>,
    closer: Arc<ClosedSessions>,
}

fn harness(config: SecurityConfig) -> Harness {
    let sanitizer = Arc::new(CountingSanitizer {
        calls: Mutex::new(0),
    });
    let sink = Arc::new(CollectingSink {
        records: Mutex::new(Vec::new()),
    });
    let closer = Arc::new(ClosedSessions {
        closed: Mutex::new(Vec::new()),
    });
    let gateway = SecurityGateway::new(
        config,
        GatewayCollaborators {
            sessions: Arc::new(StaticSessions),
            users: Arc::new(NoAdmins),
            csrf: Arc::new(AcceptAllCsrf),
            sanitizer: sanitizer.clone(),
            audit: sink.clone(),
            notifier: None,
            closer: closer.clone(),
        },
    );
    Harness {
        gateway,
        sanitizer,
        sink,
        closer,
    }
}

fn connect(session: &str, token: Option<&str>, ip: &str) -> ConnectRequest {
    ConnectRequest {
        session_id: session.to_string(),
        auth_token: token.map(|s| s.to_string()),
        ip: ip.to_string(),
        user_agent: "scenario-test".to_string(),
        namespace: "/chat".to_string(),
    }
}

/// 场景 1：同一 IP 在窗口内发起 21 次连接。
/// 第 21 次被限流拒绝，同时触发 CONNECTION_FLOOD 并封禁该 IP。
#[test]
fn scenario_connection_flood_from_single_ip() {
    let mut config = SecurityConfig::default();
    // 并发上限调高，让限流先于并发上限生效
    config.max_connections_per_ip = 100;
    let h = harness(config);

    for i in 0..20 {
        let verdict = h
            .gateway
            .validate_connection(&connect(&format!("s{}", i), None, "10.0.0.1"));
        assert!(verdict.allowed, "attempt {} should pass", i + 1);
    }

    let verdict = h
        .gateway
        .validate_connection(&connect("s20", None, "10.0.0.1"));
    assert!(!verdict.allowed);
    assert_eq!(verdict.code, Some(ErrorCode::RateLimitExceeded));
    assert_eq!(
        verdict.reason.as_deref(),
        Some("Connection rate limit exceeded")
    );

    // 滥用引擎记录了 CONNECTION_FLOOD
    let events = h.gateway.abuse_engine().recent_events(10);
    assert!(events
        .iter()
        .any(|e| e.abuse_type == AbuseType::ConnectionFlood));

    // IP 进入封禁表，后续连接直接按封禁拒绝
    assert!(h
        .gateway
        .blocks()
        .is_blocked(&BlockKey::Ip("10.0.0.1".to_string())));
    let verdict = h
        .gateway
        .validate_connection(&connect("s21", None, "10.0.0.1"));
    assert_eq!(verdict.code, Some(ErrorCode::Blocked));

    // 其它 IP 不受影响
    let verdict = h
        .gateway
        .validate_connection(&connect("other", None, "10.0.0.2"));
    assert!(verdict.allowed);
}

/// 场景 2：单连接在窗口内发 101 条消息。
/// 第 101 条被限流拒绝，同时滥用引擎记一条 MESSAGE_FLOOD。
#[test]
fn scenario_message_flood_on_single_connection() {
    let h = harness(SecurityConfig::default());

    let verdict = h
        .gateway
        .validate_connection(&connect("s1", Some("user:7"), "10.0.0.1"));
    assert!(verdict.allowed);

    let payload = serde_json::json!({ "body": "hi" });
    for i in 0..100 {
        let verdict = h.gateway.validate_message("s1", "ping", &payload);
        assert!(verdict.allowed, "message {} should pass", i + 1);
    }

    let verdict = h.gateway.validate_message("s1", "ping", &payload);
    assert!(!verdict.allowed);
    assert_eq!(verdict.code, Some(ErrorCode::RateLimitExceeded));
    assert_eq!(verdict.reason.as_deref(), Some("Message rate limit exceeded"));

    let events = h.gateway.abuse_engine().recent_events(10);
    let floods: Vec<_> = events
        .iter()
        .filter(|e| e.abuse_type == AbuseType::MessageFlood)
        .collect();
    assert_eq!(floods.len(), 1);

    // MESSAGE_FLOOD 的动作是软限流，不会断开连接
    assert_eq!(h.gateway.registry().len(), 1);
}

/// 场景 3：同一会话连续 5 次认证失败。
/// AUTHENTICATION_ABUSE 触发 disconnect，会话被移除，后续 touch 是 no-op。
#[test]
fn scenario_auth_abuse_disconnects_session() {
    let h = harness(SecurityConfig::default());

    let verdict = h
        .gateway
        .validate_connection(&connect("s1", Some("user:7"), "10.0.0.1"));
    assert!(verdict.allowed);

    for _ in 0..5 {
        h.gateway.record_auth_failure("s1");
    }

    let events = h.gateway.abuse_engine().recent_events(10);
    assert!(events
        .iter()
        .any(|e| e.abuse_type == AbuseType::AuthenticationAbuse));

    // 会话已被移除，底层关闭钩子被调用
    assert!(h.gateway.registry().get("s1").is_none());
    assert!(h.closer.closed.lock().contains(&"s1".to_string()));
    assert!(!h.gateway.registry().touch("s1"));

    // 已断开的会话上的消息按未知会话处理
    let verdict = h
        .gateway
        .validate_message("s1", "ping", &serde_json::json!({}));
    assert_eq!(verdict.code, Some(ErrorCode::UnknownSession));
}

/// 场景 4：10001 字节消息体（上限 10000）被拒绝，且不调用净化器。
#[test]
fn scenario_oversized_payload_short_circuits_sanitizer() {
    let h = harness(SecurityConfig::default());

    let verdict = h
        .gateway
        .validate_connection(&connect("s1", None, "10.0.0.1"));
    assert!(verdict.allowed);

    // 序列化后刚好 10001 字节（{"content":"x…x"} 的框架占 14 字节）
    let payload = serde_json::json!({ "content": "x".repeat(9987) });
    assert_eq!(serde_json::to_vec(&payload).unwrap().len(), 10001);

    let verdict = h.gateway.validate_message("s1", "ping", &payload);
    assert!(!verdict.allowed);
    assert_eq!(verdict.code, Some(ErrorCode::MessageTooLarge));
    assert_eq!(*h.sanitizer.calls.lock(), 0);

    // 刚好在上限内的消息体则正常走净化
    let payload = serde_json::json!({ "content": "x".repeat(9986) });
    assert_eq!(serde_json::to_vec(&payload).unwrap().len(), 10000);
    let verdict = h.gateway.validate_message("s1", "ping", &payload);
    assert!(verdict.allowed);
    assert_eq!(*h.sanitizer.calls.lock(), 1);
}

/// 连接被拒绝时审计记录包含来源 IP 与原因。
#[test]
fn audit_trail_captures_denials() {
    let mut config = SecurityConfig::default();
    config.max_connections_per_ip = 1;
    let h = harness(config);

    assert!(h
        .gateway
        .validate_connection(&connect("s1", None, "10.0.0.1"))
        .allowed);
    assert!(!h
        .gateway
        .validate_connection(&connect("s2", None, "10.0.0.1"))
        .allowed);

    let records = h.sink.records.lock();
    let denial = records
        .iter()
        .find(|r| r.event_type == "connection_rejected")
        .expect("denial should be audited");
    assert_eq!(denial.ip.as_deref(), Some("10.0.0.1"));
}

/// 快照接口反映当前运行状态且可序列化。
#[test]
fn stats_snapshot_is_serializable() {
    let h = harness(SecurityConfig::default());
    assert!(h
        .gateway
        .validate_connection(&connect("s1", Some("user:7"), "10.0.0.1"))
        .allowed);

    let stats = h.gateway.security_stats();
    assert_eq!(stats.active_connections, 1);

    let json = serde_json::to_value(&stats).expect("stats should serialize");
    assert_eq!(json["active_connections"], 1);
    assert_eq!(json["config"]["max_message_size"], 10000);
}
