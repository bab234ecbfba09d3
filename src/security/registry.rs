use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

/// 单条连接的元数据
///
/// 归 ConnectionRegistry 独占：每条消息、每次断开都会更新，
/// 连接关闭或被 Janitor 回收时销毁。
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// 会话 ID（唯一）
    pub session_id: String,
    /// 用户 ID（未认证连接为 None）
    pub user_id: Option<u64>,
    /// 来源 IP
    pub ip: String,
    /// User-Agent
    pub user_agent: String,
    /// 命名空间
    pub namespace: String,
    /// 建连时间
    pub connected_at: Instant,
    /// 最近活动时间
    pub last_activity: Instant,
    /// 累计消息数
    pub message_count: u64,
    /// 累计安全违规数
    pub security_violations: u32,
    /// 是否已认证
    pub is_authenticated: bool,
    /// 是否管理员
    pub is_admin: bool,
}

impl ConnectionInfo {
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<u64>,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            user_id,
            ip: ip.into(),
            user_agent: user_agent.into(),
            namespace: namespace.into(),
            connected_at: now,
            last_activity: now,
            message_count: 0,
            security_violations: 0,
            is_authenticated: user_id.is_some(),
            is_admin: false,
        }
    }
}

/// 连接注册表：当前在线连接的唯一事实来源
///
/// 三个索引：session → 元数据、IP → 会话集合、用户 → 会话集合。
/// Touch 发生在每条消息上，临界区只更新三个字段。
pub struct ConnectionRegistry {
    sessions: DashMap<String, ConnectionInfo>,
    by_ip: DashMap<String, HashSet<String>>,
    by_user: DashMap<u64, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_ip: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// 登记连接（同 session_id 覆盖旧记录）
    pub fn track(&self, info: ConnectionInfo) {
        let session_id = info.session_id.clone();

        // 覆盖时先清掉旧索引
        if let Some(old) = self.sessions.get(&session_id).map(|e| e.value().clone()) {
            self.remove_indices(&old);
        }

        self.by_ip
            .entry(info.ip.clone())
            .or_default()
            .insert(session_id.clone());
        if let Some(uid) = info.user_id {
            self.by_user
                .entry(uid)
                .or_default()
                .insert(session_id.clone());
        }
        self.sessions.insert(session_id.clone(), info);
        debug!("已登记连接: {}", session_id);
    }

    fn remove_indices(&self, info: &ConnectionInfo) {
        if let Some(mut set) = self.by_ip.get_mut(&info.ip) {
            set.remove(&info.session_id);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.by_ip.remove_if(&info.ip, |_, v| v.is_empty());
            }
        }
        if let Some(uid) = info.user_id {
            if let Some(mut set) = self.by_user.get_mut(&uid) {
                set.remove(&info.session_id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.by_user.remove_if(&uid, |_, v| v.is_empty());
                }
            }
        }
    }

    /// 注销连接，返回被移除的元数据；不存在则为 None（no-op）
    pub fn untrack(&self, session_id: &str) -> Option<ConnectionInfo> {
        let (_, info) = self.sessions.remove(session_id)?;
        self.remove_indices(&info);
        debug!("已注销连接: {}", session_id);
        Some(info)
    }

    pub fn get(&self, session_id: &str) -> Option<ConnectionInfo> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    pub fn count_by_ip(&self, ip: &str) -> usize {
        self.by_ip.get(ip).map(|e| e.value().len()).unwrap_or(0)
    }

    pub fn count_by_user(&self, user_id: u64) -> usize {
        self.by_user
            .get(&user_id)
            .map(|e| e.value().len())
            .unwrap_or(0)
    }

    /// 更新活动时间并累加消息数；会话不存在返回 false
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                let info = entry.value_mut();
                info.last_activity = Instant::now();
                info.message_count += 1;
                true
            }
            None => false,
        }
    }

    /// 记录一次安全违规，返回该会话的累计违规数
    pub fn record_violation(&self, session_id: &str) -> Option<u32> {
        self.sessions.get_mut(session_id).map(|mut entry| {
            let info = entry.value_mut();
            info.security_violations += 1;
            info.security_violations
        })
    }

    /// 移除并返回空闲超时的会话（Janitor 调用）
    pub fn sweep(&self, max_idle: Duration) -> Vec<String> {
        self.sweep_at(max_idle, Instant::now())
    }

    pub fn sweep_at(&self, max_idle: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_activity) > max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &expired {
            self.untrack(session_id);
        }
        if !expired.is_empty() {
            info!("清理了 {} 个空闲连接", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 全部会话的累计违规数
    pub fn total_violations(&self) -> u64 {
        self.sessions
            .iter()
            .map(|e| e.value().security_violations as u64)
            .sum()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(session: &str, user: Option<u64>, ip: &str) -> ConnectionInfo {
        ConnectionInfo::new(session, user, ip, "test-agent", "/chat")
    }

    #[test]
    fn test_track_and_indices() {
        let registry = ConnectionRegistry::new();
        registry.track(info("s1", Some(1), "10.0.0.1"));
        registry.track(info("s2", Some(1), "10.0.0.1"));
        registry.track(info("s3", None, "10.0.0.2"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count_by_ip("10.0.0.1"), 2);
        assert_eq!(registry.count_by_ip("10.0.0.2"), 1);
        assert_eq!(registry.count_by_user(1), 2);
        assert_eq!(registry.count_by_user(99), 0);
    }

    #[test]
    fn test_track_overwrite_reindexes() {
        let registry = ConnectionRegistry::new();
        registry.track(info("s1", Some(1), "10.0.0.1"));
        // 同一会话从新 IP 重连
        registry.track(info("s1", Some(1), "10.0.0.9"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.count_by_ip("10.0.0.1"), 0);
        assert_eq!(registry.count_by_ip("10.0.0.9"), 1);
        assert_eq!(registry.count_by_user(1), 1);
    }

    #[test]
    fn test_untrack_is_noop_when_absent() {
        let registry = ConnectionRegistry::new();
        assert!(registry.untrack("missing").is_none());

        registry.track(info("s1", Some(1), "10.0.0.1"));
        assert!(registry.untrack("s1").is_some());
        assert!(registry.untrack("s1").is_none());
        assert_eq!(registry.count_by_ip("10.0.0.1"), 0);
        assert_eq!(registry.count_by_user(1), 0);
    }

    #[test]
    fn test_touch_and_violations() {
        let registry = ConnectionRegistry::new();
        registry.track(info("s1", None, "10.0.0.1"));

        assert!(registry.touch("s1"));
        assert!(registry.touch("s1"));
        assert!(!registry.touch("missing"));

        assert_eq!(registry.record_violation("s1"), Some(1));
        assert_eq!(registry.record_violation("s1"), Some(2));
        assert_eq!(registry.record_violation("missing"), None);

        let info = registry.get("s1").unwrap();
        assert_eq!(info.message_count, 2);
        assert_eq!(info.security_violations, 2);
    }

    #[test]
    fn test_sweep_evicts_idle_sessions() {
        let registry = ConnectionRegistry::new();
        registry.track(info("s1", Some(1), "10.0.0.1"));
        registry.track(info("s2", None, "10.0.0.2"));

        let now = Instant::now() + Duration::from_secs(301);
        let evicted = registry.sweep_at(Duration::from_secs(300), now);
        assert_eq!(evicted.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.count_by_user(1), 0);
    }

    #[test]
    fn test_sweep_keeps_active_sessions() {
        let registry = ConnectionRegistry::new();
        registry.track(info("s1", None, "10.0.0.1"));

        let evicted = registry.sweep_at(Duration::from_secs(300), Instant::now());
        assert!(evicted.is_empty());
        assert_eq!(registry.len(), 1);
    }
}
