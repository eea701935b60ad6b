// 抓包流中继系统 - 错误类型定义
//
// 本模块定义了单个流请求处理过程中可能出现的错误，
// 以及它们到HTTP状态码的映射。响应头发出之后的错误只记录日志，
// 不会再经过这里。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::CaptureError;
use std::io;
use thiserror::Error;
use tracing::debug;

/// 流请求错误类型
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    // ========== 请求参数错误 ==========
    /// duration 参数非法
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    // ========== 输入源错误 ==========
    /// 上游输入无法打开
    #[error("Cannot open input: {0}")]
    SourceUnavailable(String),

    // ========== 过滤引擎错误 ==========
    /// 过滤引擎可执行文件不存在
    #[error("Filter engine '{0}' not found. Please install it (e.g. sudo apt-get install tshark)")]
    EngineNotFound(String),

    /// 过滤引擎启动失败
    #[error("Error starting filter engine: {0}")]
    EngineSpawn(String),

    // ========== 其他错误 ==========
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// 对应的HTTP状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
            StreamError::SourceUnavailable(_)
            | StreamError::EngineNotFound(_)
            | StreamError::EngineSpawn(_)
            | StreamError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 由启动过滤引擎时的IO错误转换
    pub fn from_spawn_error(program: &str, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => StreamError::EngineNotFound(program.to_string()),
            _ => StreamError::EngineSpawn(format!("{}: {}", program, error)),
        }
    }
}

/// 错误转换：打开上游端点失败
impl From<CaptureError> for StreamError {
    fn from(error: CaptureError) -> Self {
        StreamError::SourceUnavailable(error.to_string())
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        debug!("Rejecting stream request with {}: {}", status, self);
        (status, self.to_string()).into_response()
    }
}
