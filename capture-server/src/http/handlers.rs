use super::AppState;
use crate::streaming::SessionInfo;
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }
}

/// 健康检查数据
#[derive(Debug, Serialize)]
pub struct HealthInfo {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub input: String,
    pub engine: String,
    pub active_sessions: usize,
    pub sessions: Vec<SessionInfo>,
}

/// 信息页
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let input = state.sources.input().to_string();
    let engine = state.engine.program().display().to_string();
    let active = state.sessions.active_sessions();

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Packet Capture Stream</title></head>
<body>
<h1>Packet Capture Stream</h1>
<p>Input: <code>{input}</code></p>
<p>Filter engine: <code>{engine}</code></p>
<p>Active streams: {active}</p>
<h2>Usage</h2>
<ul>
<li><code>GET /stream</code> relays the raw capture until the client disconnects</li>
<li><code>GET /stream?duration=30</code> stops after 30 seconds</li>
<li><code>GET /stream?filter=tcp.port==80&amp;duration=10</code> applies a display filter</li>
</ul>
<p>Example: <code>curl -o capture.pcap "http://HOST/stream?duration=10"</code></p>
</body>
</html>
"#,
        input = escape_html(&input),
        engine = escape_html(&engine),
        active = active,
    ))
}

/// 健康检查
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthInfo>> {
    let sessions = state.sessions.list();
    let info = HealthInfo {
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        input: state.sources.input().to_string(),
        engine: state.engine.program().display().to_string(),
        active_sessions: sessions.len(),
        sessions,
    };
    Json(ApiResponse::success(info))
}

/// 未知路径
pub async fn not_found(uri: Uri) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, format!("Not found: {}", uri.path()))
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("/tmp/<fifo>&\""), "/tmp/&lt;fifo&gt;&amp;&quot;");
    }
}
