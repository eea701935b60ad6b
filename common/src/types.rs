use std::time::Duration;

/// 单次读写的分块大小（8KB）
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// 环形缓冲区默认容量（1MB）
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// 空读后的让出间隔
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 读写出错或对端未就绪时的退避时间
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// 环形缓冲区统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// 容量（字节）
    pub capacity: usize,
    /// 未读字节数
    pub available: usize,
    /// 累计写入字节数
    pub total_written: u64,
    /// 未被读取即被覆盖的字节数
    pub total_dropped: u64,
}
