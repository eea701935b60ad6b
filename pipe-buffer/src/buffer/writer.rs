// 抓包流中继系统 - SinkWriter实现
//
// 常驻任务：把环形缓冲区中的数据持续写往下游FIFO。
//
// 下游读者是短生命周期的（每个HTTP请求打开一次），因此：
// - 打开时没有读者（ENXIO）不是错误，稍后重试
// - 写入遇到断开的管道说明读者离开，回到打开循环等待下一个读者
// 其余的打开/写入错误对本任务是致命的，但不会影响 SourceReader。

use anyhow::{Context, Result};
use bytes::Bytes;
use common::{ensure_fifo, SharedRing, RETRY_BACKOFF};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 下游写入任务
pub struct SinkWriter {
    /// 下游FIFO路径
    output: PathBuf,
    /// 共享环形缓冲区（读者角色）
    ring: SharedRing,
    /// 分块大小
    chunk_size: usize,
}

/// 单个读者会话的结束方式
enum SessionEnd {
    /// 收到关闭请求
    Shutdown,
    /// 读者离开，未写出的分块留给下一个读者
    Detached(Bytes),
}

impl SinkWriter {
    pub fn new(output: PathBuf, ring: SharedRing, chunk_size: usize) -> Self {
        Self {
            output,
            ring,
            chunk_size,
        }
    }

    /// 运行写出循环，直到 `shutdown` 被取消或发生致命错误
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_inner(&shutdown).await;
        if let Err(e) = &result {
            error!("Writer task error: {:#}", e);
        }
        result
    }

    async fn run_inner(&self, shutdown: &CancellationToken) -> Result<()> {
        info!("Writer task: opening {}", self.output.display());

        if ensure_fifo(&self.output)? {
            info!("Writer task: output pipe created: {}", self.output.display());
        }

        let mut pending: Option<Bytes> = None;
        let mut readers: u64 = 0;

        loop {
            let sender = match self.open_sender(shutdown).await? {
                Some(sender) => sender,
                None => break,
            };

            readers += 1;
            info!(
                "Writer task: reader #{} attached to {}, writing data...",
                readers,
                self.output.display()
            );

            match self.pump(sender, pending.take(), shutdown).await? {
                SessionEnd::Shutdown => break,
                SessionEnd::Detached(unsent) => {
                    info!("Writer task: reader #{} detached", readers);
                    if !unsent.is_empty() {
                        pending = Some(unsent);
                    }
                }
            }
        }

        info!("Writer task stopped ({} readers served)", readers);
        Ok(())
    }

    /// 以写方式打开下游FIFO，等待读者接入
    ///
    /// 收到关闭请求时返回 `Ok(None)`。
    async fn open_sender(&self, shutdown: &CancellationToken) -> Result<Option<pipe::Sender>> {
        let mut waiting = false;

        loop {
            match pipe::OpenOptions::new().open_sender(&self.output) {
                Ok(sender) => return Ok(Some(sender)),
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if !waiting {
                        debug!("Writer task: waiting for a reader on {}", self.output.display());
                        waiting = true;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("cannot open {}", self.output.display()));
                }
            }
        }
    }

    /// 向一个已接入的读者持续写出
    async fn pump(
        &self,
        mut sender: pipe::Sender,
        mut pending: Option<Bytes>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd> {
        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => tokio::select! {
                    _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                    chunk = self.ring.read_timeout(self.chunk_size, RETRY_BACKOFF) => chunk,
                },
            };

            if chunk.is_empty() {
                continue;
            }

            let delivered = tokio::select! {
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                result = deliver(&mut sender, chunk) => result,
            };

            match delivered {
                Ok(None) => {}
                Ok(Some(unsent)) => return Ok(SessionEnd::Detached(unsent)),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("write to {} failed", self.output.display()));
                }
            }
        }
    }
}

/// 写出一个分块
///
/// 读者中途离开（断开的管道）时返回 `Some(未写出的部分)`，已写出的字节不再重发。
async fn deliver<W>(writer: &mut W, chunk: Bytes) -> io::Result<Option<Bytes>>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;

    while written < chunk.len() {
        match writer.write(&chunk[written..]).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Ok(Some(chunk.slice(written..)));
            }
            Err(e) => return Err(e),
        }
    }

    match writer.flush().await {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(Some(Bytes::new())),
        Err(e) => Err(e),
    }
}
