use super::error::StreamError;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

/// `/stream` 的原始查询参数
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub filter: Option<String>,
    pub duration: Option<String>,
}

/// 校验后的流请求
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// 过滤表达式，`None` 表示不过滤直接中继
    pub filter: Option<String>,
    /// 持续时间，`None` 表示直到客户端断开
    pub duration: Option<Duration>,
}

impl StreamRequest {
    /// 解析并校验查询参数
    ///
    /// 空的 `filter`/`duration` 视为未提供；duration 必须是正的有限数。
    pub fn from_query(query: StreamQuery) -> Result<Self, StreamError> {
        let filter = query.filter.filter(|f| !f.trim().is_empty());

        let duration = match query.duration.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_duration(raw)?),
        };

        Ok(Self { filter, duration })
    }

    /// 从 `start` 起算的截止时间
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        self.duration.map(|d| start + d)
    }
}

fn parse_duration(raw: &str) -> Result<Duration, StreamError> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| StreamError::InvalidDuration(format!("'{}' is not a number", raw)))?;

    if !seconds.is_finite() {
        return Err(StreamError::InvalidDuration(format!("'{}' is not finite", raw)));
    }
    if seconds <= 0.0 {
        return Err(StreamError::InvalidDuration(
            "Duration must be positive".to_string(),
        ));
    }

    Duration::try_from_secs_f64(seconds)
        .map_err(|_| StreamError::InvalidDuration(format!("'{}' is too large", raw)))
}
