use super::AppState;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // 信息页
        .route("/", get(super::handlers::index))
        // 抓包流
        .route("/stream", get(super::streaming::stream_capture))
        // 健康检查
        .route("/health", get(super::handlers::health_check))
        .fallback(super::handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
