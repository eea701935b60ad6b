// 抓包流中继系统 - Streaming模块
//
// 本模块实现了单个 `/stream` 请求的完整处理流程。
//
// # 核心组件
//
// - `StreamRequest`: 查询参数解析与校验
// - `SourceProvider`: 为每个请求提供上游输入源
// - `RelayContext` / `relay_raw`: 分块中继与结束条件
// - `FilterEngine` / `FilterSession`: 外部过滤引擎进程管理
// - `SessionRegistry`: 活跃会话登记

pub mod error;
pub mod filter;
pub mod relay;
pub mod request;
pub mod session;
pub mod source;

// 重新导出核心类型
pub use error::StreamError;
pub use filter::FilterEngine;
pub use relay::{relay_raw, RelayContext, RELAY_CHANNEL_CAPACITY};
pub use request::{StreamQuery, StreamRequest};
pub use session::{SessionInfo, SessionRegistry};
pub use source::SourceProvider;
