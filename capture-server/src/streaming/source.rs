// 抓包流中继系统 - 输入源抽象
//
// 每个流请求都需要一个上游字节源：
// - 命名端点（FIFO或普通文件）每个请求单独打开，请求结束时关闭
// - 标准输入在进程生命周期内只能消费一次，所有请求共享同一个句柄，
//   请求结束时从不关闭

use super::error::StreamError;
use async_trait::async_trait;
use common::{open_endpoint, CaptureInput, EndpointReader};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

/// 按块读取的上游字节源
///
/// 读到0字节表示暂时没有数据（没有写者或写者尚未写入），不代表流结束。
#[async_trait]
pub trait ChunkSource: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// 请求独占的端点句柄，drop 时关闭
pub struct EndpointSource {
    reader: EndpointReader,
}

#[async_trait]
impl ChunkSource for EndpointSource {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// 进程级共享输入句柄
#[derive(Clone)]
pub struct SharedInput {
    reader: Arc<Mutex<EndpointReader>>,
}

impl SharedInput {
    /// 包装进程标准输入
    pub fn stdin() -> Self {
        Self::from_reader(Box::new(tokio::io::stdin()))
    }

    pub fn from_reader(reader: EndpointReader) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }
}

#[async_trait]
impl ChunkSource for SharedInput {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await
    }
}

/// 为每个请求提供输入源
pub struct SourceProvider {
    input: CaptureInput,
    shared: Option<SharedInput>,
}

impl SourceProvider {
    pub fn new(input: CaptureInput) -> Self {
        let shared = match input {
            CaptureInput::Stdin => Some(SharedInput::stdin()),
            CaptureInput::Endpoint(_) => None,
        };
        Self { input, shared }
    }

    /// 使用给定的共享句柄代替标准输入
    #[cfg(test)]
    pub fn with_shared(shared: SharedInput) -> Self {
        Self {
            input: CaptureInput::Stdin,
            shared: Some(shared),
        }
    }

    pub fn input(&self) -> &CaptureInput {
        &self.input
    }

    /// 为一个请求打开输入源
    pub async fn open(&self) -> Result<Box<dyn ChunkSource>, StreamError> {
        if let Some(shared) = &self.shared {
            return Ok(Box::new(shared.clone()));
        }

        match &self.input {
            CaptureInput::Endpoint(path) => {
                let reader = open_endpoint(path).await?;
                debug!("Opened per-request input: {}", path.display());
                Ok(Box::new(EndpointSource { reader }))
            }
            CaptureInput::Stdin => Err(StreamError::Internal(
                "standard input handle is missing".to_string(),
            )),
        }
    }
}
