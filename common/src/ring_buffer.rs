// 抓包流中继系统 - RingBuffer实现
//
// 本模块实现了固定容量的环形字节缓冲区，用于把永不停止的上游抓包进程
// 与来来去去的下游读者解耦。
//
// # 特性
//
// - 容量固定，构造后不再增长
// - 写满后覆盖最旧的未读数据，写入永不失败
// - 读空时立即返回空结果，不阻塞
// - `SharedRing` 在两条访问路径上使用同一把互斥锁

use crate::error::{CaptureError, Result};
use crate::types::RingStats;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// 环形字节缓冲区
///
/// 单写者/单读者模型，本身不做同步；跨任务共享请使用 [`SharedRing`]。
///
/// # 示例
///
/// ```rust
/// use common::RingBuffer;
///
/// let mut ring = RingBuffer::new(4).unwrap();
/// ring.write(b"abcdef");
/// assert_eq!(&ring.read(16)[..], b"cdef");
/// ```
#[derive(Debug)]
pub struct RingBuffer {
    /// 存储区，长度恰为容量
    storage: Box<[u8]>,
    /// 写游标
    write_pos: usize,
    /// 读游标
    read_pos: usize,
    /// 未读字节数，始终在 [0, capacity] 内
    available: usize,
    /// 累计写入字节数
    total_written: u64,
    /// 累计被覆盖（丢弃）的字节数
    total_dropped: u64,
}

impl RingBuffer {
    /// 创建指定容量的环形缓冲区
    ///
    /// 容量为0时返回 `CaptureError::InvalidParameter`。
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CaptureError::InvalidParameter(
                "ring buffer capacity must be positive".to_string(),
            ));
        }

        Ok(Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            available: 0,
            total_written: 0,
            total_dropped: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 当前未读字节数
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// 写入数据
    ///
    /// 数据长度不小于容量时，缓冲区内容变为数据的最后 `capacity` 个字节。
    /// 写入会追上未读数据时，读游标跟随写游标前移，最旧的未读字节被丢弃。
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let capacity = self.capacity();
        let incoming = data.len();
        self.total_written += incoming as u64;

        let data = if incoming >= capacity {
            &data[incoming - capacity..]
        } else {
            data
        };

        // 最多分两段拷贝：写游标到末尾，再从头开始
        let first = (capacity - self.write_pos).min(data.len());
        self.storage[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.storage[..rest].copy_from_slice(&data[first..]);
        self.write_pos = (self.write_pos + data.len()) % capacity;

        let unread = self.available + incoming;
        if unread > capacity {
            self.total_dropped += (unread - capacity) as u64;
            self.available = capacity;
            self.read_pos = self.write_pos;
        } else {
            self.available = unread;
        }
    }

    /// 读取最多 `max_bytes` 个字节
    ///
    /// 没有未读数据时返回空结果，调用方需要自行等待或重试。
    pub fn read(&mut self, max_bytes: usize) -> Bytes {
        let count = max_bytes.min(self.available);
        if count == 0 {
            return Bytes::new();
        }

        let capacity = self.capacity();
        let mut out = BytesMut::with_capacity(count);
        let first = (capacity - self.read_pos).min(count);
        out.extend_from_slice(&self.storage[self.read_pos..self.read_pos + first]);
        out.extend_from_slice(&self.storage[..count - first]);

        self.read_pos = (self.read_pos + count) % capacity;
        self.available -= count;
        out.freeze()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity(),
            available: self.available,
            total_written: self.total_written,
            total_dropped: self.total_dropped,
        }
    }
}

/// 进程内共享的环形缓冲区句柄
///
/// 读写两条路径都经过同一把锁，读者不会看到写了一半的游标。
/// 写入后唤醒等待中的读者，取代按固定间隔轮询。
#[derive(Clone)]
pub struct SharedRing {
    inner: Arc<Mutex<RingBuffer>>,
    data_ready: Arc<Notify>,
}

impl SharedRing {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity)?)),
            data_ready: Arc::new(Notify::new()),
        })
    }

    /// 写入数据并唤醒读者
    pub async fn write(&self, data: &[u8]) {
        self.inner.lock().await.write(data);
        self.data_ready.notify_one();
    }

    /// 非阻塞读取，缓冲区为空时返回空结果
    pub async fn read(&self, max_bytes: usize) -> Bytes {
        self.inner.lock().await.read(max_bytes)
    }

    /// 读取数据，缓冲区为空时最多等待 `wait`
    ///
    /// 超时后仍可能返回空结果。
    pub async fn read_timeout(&self, max_bytes: usize, wait: Duration) -> Bytes {
        let chunk = self.read(max_bytes).await;
        if !chunk.is_empty() {
            return chunk;
        }

        // notify_one 在无人等待时会保留一个许可，不会丢失唤醒
        let _ = tokio::time::timeout(wait, self.data_ready.notified()).await;
        self.read(max_bytes).await
    }

    pub async fn available(&self) -> usize {
        self.inner.lock().await.available()
    }

    pub async fn stats(&self) -> RingStats {
        self.inner.lock().await.stats()
    }
}
