use super::request::StreamRequest;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 活跃流会话的快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub filter: Option<String>,
    pub duration_secs: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub bytes_sent: u64,
}

struct SessionData {
    filter: Option<String>,
    duration_secs: Option<f64>,
    started_at: DateTime<Utc>,
    bytes_sent: Arc<AtomicU64>,
}

/// 活跃流会话登记表
///
/// 只供信息页和健康检查读取，不参与中继。
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionData>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新会话，返回的守卫 drop 时自动注销
    pub fn register(&self, request: &StreamRequest) -> SessionGuard {
        let session_id = Uuid::new_v4();
        let bytes_sent = Arc::new(AtomicU64::new(0));

        self.sessions.insert(
            session_id,
            SessionData {
                filter: request.filter.clone(),
                duration_secs: request.duration.map(|d| d.as_secs_f64()),
                started_at: Utc::now(),
                bytes_sent: bytes_sent.clone(),
            },
        );
        debug!("Registered stream session: {}", session_id);

        SessionGuard {
            session_id,
            bytes_sent,
            sessions: self.sessions.clone(),
        }
    }

    /// 获取所有活跃会话
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                session_id: *entry.key(),
                filter: entry.filter.clone(),
                duration_secs: entry.duration_secs,
                started_at: entry.started_at,
                bytes_sent: entry.bytes_sent.load(Ordering::Relaxed),
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// 获取活跃会话数
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// 单个会话的登记守卫
pub struct SessionGuard {
    session_id: Uuid,
    bytes_sent: Arc<AtomicU64>,
    sessions: Arc<DashMap<Uuid, SessionData>>,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        debug!("Closed stream session: {}", self.session_id);
    }
}
