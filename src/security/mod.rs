/// 安全模块
///
/// 分层：
/// - rate_limiter：三种限流策略（滑动窗口 / 令牌桶 / 自适应）
/// - registry：在线连接注册表
/// - block：IP / 用户封禁表
/// - abuse：滥用模式检测与响应
/// - gateway：对外唯一入口，串联以上组件
/// - janitor：后台周期清扫
pub mod abuse;
pub mod block;
pub mod gateway;
pub mod janitor;
pub mod rate_limiter;
pub mod registry;

pub use abuse::{
    AbuseAction, AbuseEvent, AbusePattern, AbusePatternEngine, AbuseType, AbuseVerdict,
};
pub use block::{BlockKey, BlockStore};
pub use gateway::{
    CleanupReport, ConnectRequest, ConnectionVerdict, GatewayCollaborators, MessageVerdict,
    SecurityGateway, SecurityStats,
};
pub use janitor::{Janitor, JanitorHandle};
pub use rate_limiter::{RateLimitInfo, RateLimiter, RateLimiterStats};
pub use registry::{ConnectionInfo, ConnectionRegistry};
