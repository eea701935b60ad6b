// 抓包流中继系统 - /stream 处理器
//
// 响应头发出前的失败（参数非法、输入无法打开、引擎无法启动）
// 以对应状态码返回；之后的失败只记录日志并结束分块流。

use super::AppState;
use crate::streaming::{
    relay_raw, RelayContext, StreamError, StreamQuery, StreamRequest, RELAY_CHANNEL_CAPACITY,
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
};
use futures::StreamExt;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

const PCAP_CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

/// 抓包流
pub async fn stream_capture(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let started = Instant::now();
    let request = StreamRequest::from_query(query)?;

    let source = state.sources.open().await?;
    let session = state.sessions.register(&request);
    let session_id = session.id();

    info!(
        "[{}] New stream: filter={:?}, duration={:?}",
        session_id, request.filter, request.duration
    );

    let filter_session = match &request.filter {
        Some(filter) => Some(state.engine.spawn(filter, request.duration, session_id)?),
        None => None,
    };

    let filename = if filter_session.is_some() {
        "filtered_capture.pcap"
    } else {
        "capture.pcap"
    };

    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    let ctx = RelayContext::new(
        tx,
        request.deadline(started),
        state.chunk_size,
        session,
        state.shutdown.clone(),
    );

    tokio::spawn(async move {
        match filter_session {
            Some(filter_session) => filter_session.run(source, ctx).await,
            None => relay_raw(source, ctx).await,
        }
    });

    // 没有Content-Length，HTTP/1.1下自动使用chunked编码；通道关闭即写出结束帧
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PCAP_CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(body)
        .map_err(|e| StreamError::Internal(e.to_string()))
}
