mod config;
mod http;
mod streaming;

use anyhow::Result;
use common::{ensure_fifo, CaptureInput};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 Capture stream server starting...");

    // 加载配置
    let config = config::Config::load()?;
    info!("✓ Configuration loaded");

    let input = config.input_source();
    if let CaptureInput::Endpoint(path) = &input {
        if ensure_fifo(path)? {
            info!("✓ Created input pipe {}", path.display());
            info!(
                "  Feed it with: tcpdump -i <iface> -w - -U > {}",
                path.display()
            );
        }
    }
    info!("  Input:  {}", input);
    info!("  Engine: {}", config.engine.display());

    let state = http::AppState::new(
        streaming::SourceProvider::new(input),
        streaming::FilterEngine::new(config.engine.clone(), config.engine_grace_period()),
        config.chunk_size,
    );

    let server = http::HttpServer::new(config.listen_addr()?, state);

    info!("✅ Capture stream server ready!");
    info!("   Stream URL: http://{}:{}/stream", config.host, config.port);
    info!("   Press Ctrl+C to stop");

    server.run().await?;

    info!("Server stopped.");
    Ok(())
}
