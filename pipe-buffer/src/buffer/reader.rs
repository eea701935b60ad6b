// 抓包流中继系统 - SourceReader实现
//
// 常驻任务：持续从上游端点读取分块写入环形缓冲区。
//
// # 特性
//
// - 空读（暂时没有写者或数据）不是错误，让出片刻后重试
// - 读取出错时重新打开上游端点
// - 打开失败视为管道不可用，取消整个进程的关闭令牌

use anyhow::{Context, Result};
use common::{open_endpoint, CaptureInput, EndpointReader, SharedRing, IDLE_POLL_INTERVAL, RETRY_BACKOFF};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 上游读取任务
pub struct SourceReader {
    /// 上游输入源
    input: CaptureInput,
    /// 共享环形缓冲区（写者角色）
    ring: SharedRing,
    /// 分块大小
    chunk_size: usize,
}

impl SourceReader {
    pub fn new(input: CaptureInput, ring: SharedRing, chunk_size: usize) -> Self {
        Self {
            input,
            ring,
            chunk_size,
        }
    }

    /// 运行读取循环，直到 `shutdown` 被取消
    ///
    /// 打开上游失败时记录错误、取消 `shutdown` 并返回错误。
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Reader task: opening {}", self.input);

        let mut reader = match self.open().await {
            Ok(reader) => reader,
            Err(e) => {
                error!("Reader task: cannot open {}: {:#}", self.input, e);
                shutdown.cancel();
                return Err(e);
            }
        };

        info!("Reader task: {} opened, reading data...", self.input);

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes: u64 = 0;
        let mut idle = false;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = reader.read(&mut buffer) => result,
            };

            match result {
                Ok(0) => {
                    if !idle {
                        debug!("Reader task: upstream idle, waiting for producer");
                        idle = true;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                Ok(n) => {
                    idle = false;
                    self.ring.write(&buffer[..n]).await;
                    total_bytes += n as u64;
                }
                Err(e) => {
                    warn!("Reader task: read error on {}: {}, reopening", self.input, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }

                    reader = match self.open().await {
                        Ok(reader) => reader,
                        Err(e) => {
                            error!("Reader task: cannot reopen {}: {:#}", self.input, e);
                            shutdown.cancel();
                            return Err(e);
                        }
                    };
                }
            }
        }

        info!("Reader task stopped ({} bytes read)", total_bytes);
        Ok(())
    }

    async fn open(&self) -> Result<EndpointReader> {
        match &self.input {
            CaptureInput::Stdin => Ok(Box::new(tokio::io::stdin())),
            CaptureInput::Endpoint(path) => open_endpoint(path)
                .await
                .with_context(|| format!("failed to open {}", path.display())),
        }
    }
}
