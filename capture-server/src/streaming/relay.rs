// 抓包流中继系统 - 分块中继
//
// 中继任务把数据分块推入响应通道，HTTP层把每个分块编码为一个
// chunked 帧；通道关闭时写出结束帧。
//
// # 结束条件
//
// - 截止时间到达
// - 客户端断开（响应通道被关闭）
// - 服务器关闭
// - 上游读取出错，或过滤引擎自行退出

use super::session::SessionGuard;
use super::source::ChunkSource;
use bytes::Bytes;
use common::IDLE_POLL_INTERVAL;
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 响应通道容量（分块数）
pub const RELAY_CHANNEL_CAPACITY: usize = 16;

pub type ChunkSender = mpsc::Sender<Bytes>;

/// 中继结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    DeadlineReached,
    ClientDisconnected,
    EngineExited,
    SourceError,
    Shutdown,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RelayEnd::DeadlineReached => "duration elapsed",
            RelayEnd::ClientDisconnected => "client disconnected",
            RelayEnd::EngineExited => "filter engine exited",
            RelayEnd::SourceError => "input read error",
            RelayEnd::Shutdown => "server shutting down",
        };
        f.write_str(reason)
    }
}

/// 单个请求的中继上下文
pub struct RelayContext {
    tx: ChunkSender,
    deadline: Option<Instant>,
    chunk_size: usize,
    session: SessionGuard,
    shutdown: CancellationToken,
}

impl RelayContext {
    pub fn new(
        tx: ChunkSender,
        deadline: Option<Instant>,
        chunk_size: usize,
        session: SessionGuard,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tx,
            deadline,
            chunk_size,
            session,
            shutdown,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    /// 等待任一结束条件（截止时间、客户端断开、服务器关闭）
    pub async fn interrupted(&self) -> RelayEnd {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => RelayEnd::Shutdown,
            _ = sleep_until_opt(self.deadline) => RelayEnd::DeadlineReached,
            _ = self.tx.closed() => RelayEnd::ClientDisconnected,
        }
    }

    /// 发送一个分块；通道满时等待，期间仍然响应结束条件
    pub async fn send(&self, chunk: Bytes) -> Result<(), RelayEnd> {
        let len = chunk.len();
        tokio::select! {
            biased;
            end = self.interrupted() => Err(end),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(chunk);
                    self.session.add_bytes(len);
                    Ok(())
                }
                Err(_) => Err(RelayEnd::ClientDisconnected),
            },
        }
    }

    /// 结束中继：关闭响应通道（HTTP层随即写出结束帧）
    ///
    /// 返回会话守卫，调用方在清理完成后再释放它。
    pub fn close(self, end: RelayEnd) -> SessionGuard {
        info!(
            "[{}] Stream ended ({}): {} bytes sent",
            self.session.id(),
            end,
            self.session.bytes_sent()
        );
        self.session
    }

    /// 暂时没有数据，让出片刻
    pub async fn idle(&self) -> Result<(), RelayEnd> {
        tokio::select! {
            end = self.interrupted() => Err(end),
            _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => Ok(()),
        }
    }
}

/// 没有截止时间时永不完成
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 直接中继原始输入（无过滤）
pub async fn relay_raw(source: Box<dyn ChunkSource>, ctx: RelayContext) -> RelayEnd {
    let end = pump_raw(source, &ctx).await;
    drop(ctx.close(end));
    end
}

async fn pump_raw(mut source: Box<dyn ChunkSource>, ctx: &RelayContext) -> RelayEnd {
    let mut buffer = vec![0u8; ctx.chunk_size()];

    loop {
        let read = tokio::select! {
            end = ctx.interrupted() => return end,
            read = source.read_chunk(&mut buffer) => read,
        };

        let step = match read {
            Ok(0) => ctx.idle().await,
            Ok(n) => ctx.send(Bytes::copy_from_slice(&buffer[..n])).await,
            Err(e) => {
                warn!("[{}] Input read error: {}", ctx.session().id(), e);
                return RelayEnd::SourceError;
            }
        };

        if let Err(end) = step {
            return end;
        }
    }
}
