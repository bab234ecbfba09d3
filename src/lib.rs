pub mod config;
pub mod error;
pub mod external;
pub mod logging;
pub mod security;

pub use config::{RateLimitRule, SecurityConfig, StrategyKind};
pub use error::{ErrorCode, ErrorResponse, Result, SecurityError};
pub use logging::{init_logging, LogFormat};

pub use external::{
    AuditBackend, AuditRecord, BufferedAuditSink, ConnectionCloser, CsrfValidator, FieldRules,
    InputSanitizer, NoopCloser, NotificationChannel, SanitizeError, SecurityAuditSink, SessionData,
    SessionLookup, Severity, UserDirectory,
};
pub use security::{
    AbusePatternEngine, AbuseType, AbuseVerdict, BlockKey, BlockStore, ConnectRequest,
    ConnectionInfo, ConnectionRegistry, ConnectionVerdict, GatewayCollaborators, Janitor,
    JanitorHandle, MessageVerdict, RateLimiter, SecurityGateway, SecurityStats,
};
