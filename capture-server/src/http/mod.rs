mod handlers;
mod routes;
mod server;
mod streaming;


pub use routes::create_router;
pub use server::HttpServer;

use crate::streaming::{FilterEngine, SessionRegistry, SourceProvider};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 所有处理器共享的应用状态
#[derive(Clone)]
pub struct AppState {
    /// 上游输入源
    pub sources: Arc<SourceProvider>,
    /// 过滤引擎配置
    pub engine: Arc<FilterEngine>,
    /// 活跃会话登记表
    pub sessions: SessionRegistry,
    /// 中继分块大小
    pub chunk_size: usize,
    /// 启动时间
    pub started_at: DateTime<Utc>,
    /// 服务器关闭令牌，取消后所有流结束
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(sources: SourceProvider, engine: FilterEngine, chunk_size: usize) -> Self {
        Self {
            sources: Arc::new(sources),
            engine: Arc::new(engine),
            sessions: SessionRegistry::new(),
            chunk_size,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }
}
