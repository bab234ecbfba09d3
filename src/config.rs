use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 限流策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// 滑动窗口（精确计数）
    SlidingWindow,
    /// 令牌桶（平滑突发）
    TokenBucket,
    /// 自适应（违规越多额度越小）
    Adaptive,
}

/// 单个操作的限流规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// 策略
    pub strategy: StrategyKind,
    /// 窗口内允许的次数（令牌桶为桶容量）
    pub limit: u32,
    /// 窗口长度（秒）
    pub window_secs: u64,
    /// 令牌桶补充速率（每秒令牌数），缺省为 limit / window_secs
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// 自适应策略的惩罚系数（每次违规额度乘以该系数）
    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,
}

fn default_penalty_multiplier() -> f64 {
    0.5
}

impl RateLimitRule {
    pub fn sliding_window(limit: u32, window_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::SlidingWindow,
            limit,
            window_secs,
            refill_rate: None,
            penalty_multiplier: default_penalty_multiplier(),
        }
    }

    pub fn token_bucket(limit: u32, window_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::TokenBucket,
            limit,
            window_secs,
            refill_rate: None,
            penalty_multiplier: default_penalty_multiplier(),
        }
    }

    pub fn adaptive(limit: u32, window_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::Adaptive,
            limit,
            window_secs,
            refill_rate: None,
            penalty_multiplier: default_penalty_multiplier(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// 令牌桶的实际补充速率
    pub fn effective_refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.limit as f64 / self.window_secs.max(1) as f64)
    }
}

/// 滥用检测相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// 临时封禁时长（秒），默认 1 小时
    #[serde(default = "default_temp_ban_secs")]
    pub temp_ban_secs: u64,
    /// "永久"封禁时长（秒），默认 365 天
    ///
    /// 永久封禁本质上就是一条很长的临时封禁，不需要单独的数据结构。
    #[serde(default = "default_permanent_ban_secs")]
    pub permanent_ban_secs: u64,
    /// 大消息阈值（字节），超过则计入资源耗尽统计
    #[serde(default = "default_large_payload_bytes")]
    pub large_payload_bytes: usize,
    /// 滥用事件历史保留时长（秒），默认 24 小时
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
}

fn default_temp_ban_secs() -> u64 {
    3600
}

fn default_permanent_ban_secs() -> u64 {
    365 * 24 * 3600
}

fn default_large_payload_bytes() -> usize {
    5000
}

fn default_event_retention_secs() -> u64 {
    24 * 3600
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            temp_ban_secs: default_temp_ban_secs(),
            permanent_ban_secs: default_permanent_ban_secs(),
            large_payload_bytes: default_large_payload_bytes(),
            event_retention_secs: default_event_retention_secs(),
        }
    }
}

impl AbuseConfig {
    pub fn temp_ban(&self) -> Duration {
        Duration::from_secs(self.temp_ban_secs)
    }

    pub fn permanent_ban(&self) -> Duration {
        Duration::from_secs(self.permanent_ban_secs)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_secs)
    }
}

/// 安全引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// 连接限流：窗口内每 IP 允许的连接次数
    #[serde(default = "default_connection_rate_limit")]
    pub connection_rate_limit: u32,
    /// 消息限流：窗口内每用户/会话允许的消息数
    #[serde(default = "default_message_rate_limit")]
    pub message_rate_limit: u32,
    /// 令牌桶突发容量（用于配置了 token_bucket 策略的操作）
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    /// 消息最大序列化字节数
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// 事件类型白名单
    #[serde(default = "default_allowed_event_types")]
    pub allowed_event_types: HashSet<String>,
    /// 需要 CSRF 校验的事件类型（状态变更类）
    #[serde(default = "default_csrf_protected_events")]
    pub csrf_protected_events: HashSet<String>,
    /// 每个 IP 的最大并发连接数
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// 每个用户的最大并发连接数
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// 连接空闲超时（秒）
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// 单连接累计违规达到该值视为可疑
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_activity_threshold: u32,
    /// 滥用规则给出 disconnect 动作时是否自动断开
    #[serde(default = "default_true")]
    pub auto_disconnect_on_abuse: bool,
    /// 限流身份无法解析时是否放行（fail-open）
    ///
    /// 源系统的隐式行为，这里做成显式开关：
    /// - true：内部错误时放行，保可用性（默认，与源系统一致）
    /// - false：内部错误时拒绝，保严格性
    #[serde(default = "default_true")]
    pub fail_open_on_unresolved_identity: bool,
    /// 需要管理员权限的命名空间
    #[serde(default = "default_admin_namespaces")]
    pub admin_namespaces: HashSet<String>,
    /// Janitor 清扫间隔（秒）
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
    /// 按操作名的限流规则表（启动时解析一次，不做运行时类型分发）
    #[serde(default = "default_operations")]
    pub operations: HashMap<String, RateLimitRule>,
    /// 滥用检测配置
    #[serde(default)]
    pub abuse: AbuseConfig,
}

fn default_connection_rate_limit() -> u32 {
    20
}

fn default_message_rate_limit() -> u32 {
    100
}

fn default_burst_limit() -> u32 {
    10
}

fn default_max_message_size() -> usize {
    10000
}

fn default_allowed_event_types() -> HashSet<String> {
    [
        "connect",
        "disconnect",
        "message",
        "ping",
        "pong",
        "typing",
        "presence",
        "ack",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_csrf_protected_events() -> HashSet<String> {
    ["message"].iter().map(|s| s.to_string()).collect()
}

fn default_max_connections_per_ip() -> usize {
    20
}

fn default_max_connections_per_user() -> usize {
    10
}

fn default_connection_timeout() -> u64 {
    300
}

fn default_suspicious_threshold() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_admin_namespaces() -> HashSet<String> {
    ["/admin"].iter().map(|s| s.to_string()).collect()
}

fn default_janitor_interval() -> u64 {
    60
}

fn default_operations() -> HashMap<String, RateLimitRule> {
    let mut ops = HashMap::new();
    ops.insert(
        "connection".to_string(),
        RateLimitRule::sliding_window(default_connection_rate_limit(), 60),
    );
    ops.insert(
        "message".to_string(),
        RateLimitRule::sliding_window(default_message_rate_limit(), 60),
    );
    // 认证尝试用自适应策略：失败越多收得越紧
    ops.insert("auth".to_string(), RateLimitRule::adaptive(5, 300));
    ops
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            connection_rate_limit: default_connection_rate_limit(),
            message_rate_limit: default_message_rate_limit(),
            burst_limit: default_burst_limit(),
            max_message_size: default_max_message_size(),
            allowed_event_types: default_allowed_event_types(),
            csrf_protected_events: default_csrf_protected_events(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_connections_per_user: default_max_connections_per_user(),
            connection_timeout_secs: default_connection_timeout(),
            suspicious_activity_threshold: default_suspicious_threshold(),
            auto_disconnect_on_abuse: true,
            fail_open_on_unresolved_identity: true,
            admin_namespaces: default_admin_namespaces(),
            janitor_interval_secs: default_janitor_interval(),
            operations: default_operations(),
            abuse: AbuseConfig::default(),
        }
    }
}

impl SecurityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 严格配置（公网环境、已有明确攻击）
    pub fn strict() -> Self {
        let mut config = Self::default();
        config.connection_rate_limit = 10;
        config.message_rate_limit = 50;
        config.max_connections_per_ip = 10;
        config.max_connections_per_user = 5;
        config.fail_open_on_unresolved_identity = false;
        config.operations.insert(
            "connection".to_string(),
            RateLimitRule::adaptive(10, 60),
        );
        config.operations.insert(
            "message".to_string(),
            RateLimitRule::sliding_window(50, 60),
        );
        config
    }

    /// 宽松配置（内网 / 早期阶段，只想兜底）
    pub fn permissive() -> Self {
        let mut config = Self::default();
        config.connection_rate_limit = 100;
        config.message_rate_limit = 500;
        config.max_connections_per_ip = 100;
        config.max_connections_per_user = 50;
        config.operations.insert(
            "connection".to_string(),
            RateLimitRule::token_bucket(100, 60),
        );
        config.operations.insert(
            "message".to_string(),
            RateLimitRule::token_bucket(500, 60),
        );
        config
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;

        let config: SecurityConfig = toml::from_str(&content)
            .with_context(|| format!("配置文件格式错误: {:?}", path.as_ref()))?;

        config.validate()?;
        info!("已从 {:?} 加载安全配置", path.as_ref());
        Ok(config)
    }

    /// 应用环境变量覆盖（SOCKGUARD_ 前缀）
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = env::var("SOCKGUARD_MAX_MESSAGE_SIZE") {
            match v.parse() {
                Ok(n) => self.max_message_size = n,
                Err(_) => warn!("SOCKGUARD_MAX_MESSAGE_SIZE 无法解析: {}", v),
            }
        }
        if let Ok(v) = env::var("SOCKGUARD_CONNECTION_RATE_LIMIT") {
            match v.parse() {
                Ok(n) => self.connection_rate_limit = n,
                Err(_) => warn!("SOCKGUARD_CONNECTION_RATE_LIMIT 无法解析: {}", v),
            }
        }
        if let Ok(v) = env::var("SOCKGUARD_MESSAGE_RATE_LIMIT") {
            match v.parse() {
                Ok(n) => self.message_rate_limit = n,
                Err(_) => warn!("SOCKGUARD_MESSAGE_RATE_LIMIT 无法解析: {}", v),
            }
        }
        if let Ok(v) = env::var("SOCKGUARD_FAIL_OPEN") {
            self.fail_open_on_unresolved_identity = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// 配置合法性检查
    pub fn validate(&self) -> Result<()> {
        for (op, rule) in &self.operations {
            if rule.limit == 0 {
                anyhow::bail!("操作 {} 的 limit 不能为 0", op);
            }
            if rule.window_secs == 0 {
                anyhow::bail!("操作 {} 的 window_secs 不能为 0", op);
            }
            if !(0.0..1.0).contains(&rule.penalty_multiplier) {
                anyhow::bail!("操作 {} 的 penalty_multiplier 必须在 [0, 1) 区间", op);
            }
        }
        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size 不能为 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SecurityConfig::default();
        assert_eq!(config.connection_rate_limit, 20);
        assert_eq!(config.message_rate_limit, 100);
        assert_eq!(config.max_message_size, 10000);
        assert!(config.allowed_event_types.contains("ping"));
        assert!(config.fail_open_on_unresolved_identity);
        assert!(config.operations.contains_key("connection"));
        config.validate().unwrap();
    }

    #[test]
    fn test_profiles() {
        let strict = SecurityConfig::strict();
        assert!(!strict.fail_open_on_unresolved_identity);
        assert!(strict.connection_rate_limit < SecurityConfig::default().connection_rate_limit);
        strict.validate().unwrap();

        let permissive = SecurityConfig::permissive();
        assert!(permissive.message_rate_limit > SecurityConfig::default().message_rate_limit);
        permissive.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            connection_rate_limit = 5
            max_message_size = 2048

            [operations.message]
            strategy = "token_bucket"
            limit = 30
            window_secs = 10
        "#;
        let config: SecurityConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection_rate_limit, 5);
        assert_eq!(config.max_message_size, 2048);
        let rule = &config.operations["message"];
        assert_eq!(rule.strategy, StrategyKind::TokenBucket);
        assert_eq!(rule.limit, 30);
        assert!((rule.effective_refill_rate() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = SecurityConfig::default();
        config
            .operations
            .insert("bad".to_string(), RateLimitRule::sliding_window(0, 60));
        assert!(config.validate().is_err());
    }
}
