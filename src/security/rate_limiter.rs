/// 多策略速率限制器
///
/// 核心特性：
/// 1. 按 (operation, identifier) 组合限流
/// 2. 三种可插拔策略：滑动窗口 / 令牌桶 / 自适应
/// 3. 策略在配置加载时解析一次，运行时不做类型分发
/// 4. 使用 sharded HashMap 保证高并发性能
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{RateLimitRule, SecurityConfig, StrategyKind};

/// 每个 key 的限流状态（具体形状取决于策略）
#[derive(Debug)]
pub enum RateLimitState {
    /// 滑动窗口：窗口内的请求时间戳
    Window { hits: VecDeque<Instant> },
    /// 令牌桶
    Bucket { tokens: f64, last_refill: Instant },
    /// 自适应：滑动窗口 + 违规惩罚
    Adaptive {
        hits: VecDeque<Instant>,
        violations: u32,
        last_violation: Option<Instant>,
    },
}

/// 限流查询结果
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// 当前生效的额度（自适应策略下会小于配置值）
    pub limit: u32,
    /// 剩余可用次数
    pub remaining: u32,
    /// 距离额度恢复的时间
    pub reset_after: Duration,
}

/// 限流策略能力
///
/// 所有方法都显式接收 `now`，便于确定性测试。
pub trait RateLimitStrategy: Send + Sync {
    /// 新 key 的初始状态
    fn new_state(&self, rule: &RateLimitRule, now: Instant) -> RateLimitState;

    /// 检查并消耗额度
    fn is_allowed(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> bool;

    /// 当前生效额度
    fn current_limit(&self, state: &RateLimitState, rule: &RateLimitRule) -> u32;

    /// 剩余额度
    fn remaining(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> u32;

    /// 距离额度恢复的时间
    fn reset_after(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> Duration;

    /// 把该 key 视为已耗尽（滥用引擎的软限流动作）
    fn exhaust(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant);

    /// 状态是否已空闲（可被 Janitor 回收）
    fn is_idle(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> bool;
}

fn prune_window(hits: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&t) = hits.front() {
        if now.saturating_duration_since(t) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

/// 滑动窗口：精确计数，O(窗口大小) 内存
pub struct SlidingWindowStrategy;

impl RateLimitStrategy for SlidingWindowStrategy {
    fn new_state(&self, _rule: &RateLimitRule, _now: Instant) -> RateLimitState {
        RateLimitState::Window {
            hits: VecDeque::new(),
        }
    }

    fn is_allowed(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Window { hits } = state else {
            return false;
        };
        prune_window(hits, rule.window(), now);
        if hits.len() < rule.limit as usize {
            hits.push_back(now);
            true
        } else {
            false
        }
    }

    fn current_limit(&self, _state: &RateLimitState, rule: &RateLimitRule) -> u32 {
        rule.limit
    }

    fn remaining(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> u32 {
        let RateLimitState::Window { hits } = state else {
            return 0;
        };
        prune_window(hits, rule.window(), now);
        rule.limit.saturating_sub(hits.len() as u32)
    }

    fn reset_after(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> Duration {
        let RateLimitState::Window { hits } = state else {
            return Duration::ZERO;
        };
        match hits.front() {
            Some(&oldest) => rule
                .window()
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    fn exhaust(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) {
        if let RateLimitState::Window { hits } = state {
            prune_window(hits, rule.window(), now);
            while hits.len() < rule.limit as usize {
                hits.push_back(now);
            }
        }
    }

    fn is_idle(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Window { hits } = state else {
            return true;
        };
        match hits.back() {
            Some(&latest) => now.saturating_duration_since(latest) >= rule.window(),
            None => true,
        }
    }
}

/// 令牌桶：固定速率补充，突发友好
pub struct TokenBucketStrategy;

impl TokenBucketStrategy {
    fn refill(tokens: &mut f64, last_refill: &mut Instant, rule: &RateLimitRule, now: Instant) {
        let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
        *tokens = (*tokens + elapsed * rule.effective_refill_rate()).min(rule.limit as f64);
        *last_refill = now;
    }
}

impl RateLimitStrategy for TokenBucketStrategy {
    fn new_state(&self, rule: &RateLimitRule, now: Instant) -> RateLimitState {
        RateLimitState::Bucket {
            tokens: rule.limit as f64,
            last_refill: now,
        }
    }

    fn is_allowed(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Bucket {
            tokens,
            last_refill,
        } = state
        else {
            return false;
        };
        Self::refill(tokens, last_refill, rule, now);
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn current_limit(&self, _state: &RateLimitState, rule: &RateLimitRule) -> u32 {
        rule.limit
    }

    fn remaining(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> u32 {
        let RateLimitState::Bucket {
            tokens,
            last_refill,
        } = state
        else {
            return 0;
        };
        Self::refill(tokens, last_refill, rule, now);
        *tokens as u32
    }

    fn reset_after(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> Duration {
        let RateLimitState::Bucket {
            tokens,
            last_refill,
        } = state
        else {
            return Duration::ZERO;
        };
        let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
        let current = (*tokens + elapsed * rule.effective_refill_rate()).min(rule.limit as f64);
        if current >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - current) / rule.effective_refill_rate())
        }
    }

    fn exhaust(&self, state: &mut RateLimitState, _rule: &RateLimitRule, now: Instant) {
        if let RateLimitState::Bucket {
            tokens,
            last_refill,
        } = state
        {
            *tokens = 0.0;
            *last_refill = now;
        }
    }

    fn is_idle(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Bucket {
            tokens,
            last_refill,
        } = state
        else {
            return true;
        };
        let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
        tokens + elapsed * rule.effective_refill_rate() >= rule.limit as f64
    }
}

/// 自适应：滑动窗口变体，违规越多生效额度按几何级数收缩
///
/// 信任侵蚀模型：滥用方被越收越紧，安静一段时间后逐步恢复。
pub struct AdaptiveStrategy;

impl AdaptiveStrategy {
    fn effective_limit(rule: &RateLimitRule, violations: u32) -> u32 {
        let scaled = rule.limit as f64 * rule.penalty_multiplier.powi(violations as i32);
        (scaled.floor() as u32).max(1)
    }
}

impl RateLimitStrategy for AdaptiveStrategy {
    fn new_state(&self, _rule: &RateLimitRule, _now: Instant) -> RateLimitState {
        RateLimitState::Adaptive {
            hits: VecDeque::new(),
            violations: 0,
            last_violation: None,
        }
    }

    fn is_allowed(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Adaptive {
            hits,
            violations,
            last_violation,
        } = state
        else {
            return false;
        };
        prune_window(hits, rule.window(), now);

        let effective = Self::effective_limit(rule, *violations);
        if hits.len() < effective as usize {
            hits.push_back(now);
            // 成功且距上次违规超过 2 倍窗口：衰减一次违规，并重置衰减时钟
            if let Some(last) = *last_violation {
                if now.saturating_duration_since(last) > rule.window() * 2 && *violations > 0 {
                    *violations -= 1;
                    *last_violation = if *violations == 0 { None } else { Some(now) };
                }
            }
            true
        } else {
            *violations = violations.saturating_add(1);
            *last_violation = Some(now);
            false
        }
    }

    fn current_limit(&self, state: &RateLimitState, rule: &RateLimitRule) -> u32 {
        match state {
            RateLimitState::Adaptive { violations, .. } => Self::effective_limit(rule, *violations),
            _ => rule.limit,
        }
    }

    fn remaining(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) -> u32 {
        let RateLimitState::Adaptive {
            hits, violations, ..
        } = state
        else {
            return 0;
        };
        prune_window(hits, rule.window(), now);
        Self::effective_limit(rule, *violations).saturating_sub(hits.len() as u32)
    }

    fn reset_after(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> Duration {
        let RateLimitState::Adaptive { hits, .. } = state else {
            return Duration::ZERO;
        };
        match hits.front() {
            Some(&oldest) => rule
                .window()
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    fn exhaust(&self, state: &mut RateLimitState, rule: &RateLimitRule, now: Instant) {
        if let RateLimitState::Adaptive {
            hits, violations, ..
        } = state
        {
            prune_window(hits, rule.window(), now);
            let effective = Self::effective_limit(rule, *violations);
            while hits.len() < effective as usize {
                hits.push_back(now);
            }
        }
    }

    fn is_idle(&self, state: &RateLimitState, rule: &RateLimitRule, now: Instant) -> bool {
        let RateLimitState::Adaptive {
            hits,
            violations,
            last_violation,
        } = state
        else {
            return true;
        };
        let window_empty = match hits.back() {
            Some(&latest) => now.saturating_duration_since(latest) >= rule.window(),
            None => true,
        };
        // 还有未衰减完的违规就不能回收，否则惩罚会被重置
        let violations_cleared = *violations == 0
            || last_violation
                .map(|t| now.saturating_duration_since(t) > rule.window() * 4)
                .unwrap_or(true);
        window_empty && violations_cleared
    }
}

fn strategy_for(kind: StrategyKind) -> Box<dyn RateLimitStrategy> {
    match kind {
        StrategyKind::SlidingWindow => Box::new(SlidingWindowStrategy),
        StrategyKind::TokenBucket => Box::new(TokenBucketStrategy),
        StrategyKind::Adaptive => Box::new(AdaptiveStrategy),
    }
}

struct OperationEntry {
    strategy: Box<dyn RateLimitStrategy>,
    rule: RateLimitRule,
}

/// 分片状态表（减少锁竞争）
const SHARD_COUNT: usize = 16;

struct ShardedStates {
    shards: [Mutex<HashMap<String, RateLimitState>>; SHARD_COUNT],
}

impl ShardedStates {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, RateLimitState>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// 限流器统计
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RateLimiterStats {
    /// 检查总数
    pub checked: u64,
    /// 拒绝总数
    pub denied: u64,
    /// 当前跟踪的 key 数
    pub tracked_keys: usize,
}

/// 标识符解析：显式标识 → 用户 → IP，都没有则返回 None
///
/// 返回 None 时由配置决定 fail-open / fail-closed。
pub fn resolve_identifier(
    explicit: Option<&str>,
    user_id: Option<u64>,
    ip: Option<&str>,
) -> Option<String> {
    if let Some(id) = explicit {
        return Some(id.to_string());
    }
    if let Some(uid) = user_id {
        return Some(format!("user_{}", uid));
    }
    ip.map(|addr| format!("ip_{}", addr))
}

/// 多策略限流器
pub struct RateLimiter {
    operations: HashMap<String, OperationEntry>,
    default_entry: OperationEntry,
    states: ShardedStates,
    checked: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    /// 从配置构建：每个操作的策略在这里解析一次
    ///
    /// `connection` / `message` 的额度以顶层标量配置为准。
    pub fn from_config(config: &SecurityConfig) -> Self {
        let mut operations = HashMap::new();
        for (op, rule) in &config.operations {
            let mut rule = rule.clone();
            match op.as_str() {
                "connection" => rule.limit = config.connection_rate_limit,
                "message" => rule.limit = config.message_rate_limit,
                _ => {}
            }
            operations.insert(
                op.clone(),
                OperationEntry {
                    strategy: strategy_for(rule.strategy),
                    rule,
                },
            );
        }

        // 未配置的操作走令牌桶兜底：burst_limit 次/秒的突发额度
        let default_rule = RateLimitRule::token_bucket(config.burst_limit.max(1), 1);
        Self {
            operations,
            default_entry: OperationEntry {
                strategy: strategy_for(default_rule.strategy),
                rule: default_rule,
            },
            states: ShardedStates::new(),
            checked: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    fn entry(&self, operation: &str) -> &OperationEntry {
        self.operations
            .get(operation)
            .unwrap_or(&self.default_entry)
    }

    fn key(operation: &str, identifier: &str) -> String {
        format!("{}:{}", operation, identifier)
    }

    /// 检查并消耗额度
    pub fn check_limit(&self, operation: &str, identifier: &str) -> bool {
        self.check_limit_at(operation, identifier, Instant::now())
    }

    pub fn check_limit_at(&self, operation: &str, identifier: &str, now: Instant) -> bool {
        let entry = self.entry(operation);
        let key = Self::key(operation, identifier);
        let shard = self.states.shard(&key);
        let mut states = shard.lock();
        let state = states
            .entry(key)
            .or_insert_with(|| entry.strategy.new_state(&entry.rule, now));

        self.checked.fetch_add(1, Ordering::Relaxed);
        let allowed = entry.strategy.is_allowed(state, &entry.rule, now);
        if !allowed {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// 查询额度信息（不消耗）
    pub fn limit_info(&self, operation: &str, identifier: &str) -> RateLimitInfo {
        self.limit_info_at(operation, identifier, Instant::now())
    }

    pub fn limit_info_at(&self, operation: &str, identifier: &str, now: Instant) -> RateLimitInfo {
        let entry = self.entry(operation);
        let key = Self::key(operation, identifier);
        let shard = self.states.shard(&key);
        let mut states = shard.lock();
        match states.get_mut(&key) {
            Some(state) => RateLimitInfo {
                limit: entry.strategy.current_limit(state, &entry.rule),
                remaining: entry.strategy.remaining(state, &entry.rule, now),
                reset_after: entry.strategy.reset_after(state, &entry.rule, now),
            },
            None => RateLimitInfo {
                limit: entry.rule.limit,
                remaining: entry.rule.limit,
                reset_after: Duration::ZERO,
            },
        }
    }

    /// 清空某个 key 的状态
    pub fn reset(&self, operation: &str, identifier: &str) {
        let key = Self::key(operation, identifier);
        self.states.shard(&key).lock().remove(&key);
    }

    /// 把某个 key 视为已耗尽（滥用引擎的 rate-limit 动作）
    pub fn exhaust(&self, operation: &str, identifier: &str) {
        self.exhaust_at(operation, identifier, Instant::now())
    }

    pub fn exhaust_at(&self, operation: &str, identifier: &str, now: Instant) {
        let entry = self.entry(operation);
        let key = Self::key(operation, identifier);
        let shard = self.states.shard(&key);
        let mut states = shard.lock();
        let state = states
            .entry(key)
            .or_insert_with(|| entry.strategy.new_state(&entry.rule, now));
        entry.strategy.exhaust(state, &entry.rule, now);
    }

    /// 回收空闲窗口（Janitor 调用）
    ///
    /// 每次只锁一个分片，不会长时间阻塞热路径。
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.states.shards {
            let mut states = shard.lock();
            states.retain(|key, state| {
                let op = key.split(':').next().unwrap_or("");
                let entry = self.entry(op);
                let idle = entry.strategy.is_idle(state, &entry.rule, now);
                if idle {
                    removed += 1;
                }
                !idle
            });
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            checked: self.checked.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            tracked_keys: self.states.len(),
        }
    }
}
