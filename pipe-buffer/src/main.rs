mod buffer;
mod config;

use anyhow::Result;
use common::SharedRing;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 缓冲区统计日志间隔
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("📦 Named pipe buffer starting...");

    // 加载配置
    let config = config::Config::load()?;
    info!("✓ Configuration loaded");
    info!("  Input:  {}", config.input_source());
    info!("  Output: {}", config.output.display());
    info!(
        "  Buffer: {:.1} MB",
        config.buffer_size as f64 / 1024.0 / 1024.0
    );

    let ring = SharedRing::new(config.buffer_size)?;
    let shutdown = CancellationToken::new();

    // 任一任务结束都会取消令牌，另一任务随之有序退出
    let reader = buffer::SourceReader::new(config.input_source(), ring.clone(), config.chunk_size);
    let reader_token = shutdown.clone();
    let reader_handle = tokio::spawn(async move {
        let result = reader.run(reader_token.clone()).await;
        reader_token.cancel();
        result
    });

    let writer = buffer::SinkWriter::new(config.output.clone(), ring.clone(), config.chunk_size);
    let writer_token = shutdown.clone();
    let writer_handle = tokio::spawn(async move {
        let result = writer.run(writer_token.clone()).await;
        writer_token.cancel();
        result
    });

    // 定期输出缓冲区统计
    let stats_ring = ring.clone();
    let stats_token = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = stats_token.cancelled() => break,
                _ = interval.tick() => {
                    let stats = stats_ring.stats().await;
                    debug!(
                        "Ring buffer: {}/{} bytes unread, {} written, {} dropped",
                        stats.available, stats.capacity, stats.total_written, stats.total_dropped
                    );
                }
            }
        }
    });

    info!("✅ Pipe buffer ready!");
    info!("   Press Ctrl+C to stop");

    tokio::select! {
        _ = common::shutdown_signal() => info!("Stopping buffer process..."),
        _ = shutdown.cancelled() => warn!("Buffer task ended, stopping buffer process..."),
    }
    shutdown.cancel();

    let (reader_result, writer_result) = tokio::join!(reader_handle, writer_handle);

    let stats = ring.stats().await;
    info!(
        "Buffered {} bytes in total, {} overwritten before delivery",
        stats.total_written, stats.total_dropped
    );

    // 读端失败意味着管道不可用，以错误码退出
    reader_result??;
    if let Err(e) = writer_result? {
        warn!("Writer task ended with error: {:#}", e);
    }

    info!("Buffer process stopped.");
    Ok(())
}
