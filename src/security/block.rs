use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

/// 封禁键：IP 或用户
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum BlockKey {
    Ip(String),
    User(u64),
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKey::Ip(ip) => write!(f, "ip:{}", ip),
            BlockKey::User(uid) => write!(f, "user:{}", uid),
        }
    }
}

/// 封禁表
///
/// 封禁远少于查询，用 DashMap 保证读路径几乎无锁。
/// 过期采用惰性判定：读到过期条目当场移除，不依赖 Janitor 及时清扫。
pub struct BlockStore {
    entries: DashMap<BlockKey, Instant>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// 封禁到 now + duration；已有条目取两者中较晚的截止时间
    pub fn block(&self, key: BlockKey, duration: Duration) {
        self.block_at(key, duration, Instant::now())
    }

    pub fn block_at(&self, key: BlockKey, duration: Duration, now: Instant) {
        let until = now + duration;
        let mut entry = self.entries.entry(key.clone()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        drop(entry);
        warn!("🚫 封禁 {}，时长 {:?}", key, duration);
    }

    /// 是否处于封禁中（过期条目当场移除）
    pub fn is_blocked(&self, key: &BlockKey) -> bool {
        self.is_blocked_at(key, Instant::now())
    }

    pub fn is_blocked_at(&self, key: &BlockKey, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                if now < *entry.value() {
                    true
                } else {
                    drop(entry);
                    self.entries.remove_if(key, |_, until| now >= *until);
                    false
                }
            }
            None => false,
        }
    }

    /// 手动解封
    pub fn unblock(&self, key: &BlockKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            info!("已解封 {}", key);
        }
        removed
    }

    /// 清除已过期的条目（Janitor 调用）
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| now < *until);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
