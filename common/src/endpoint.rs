// 抓包流中继系统 - 字节端点
//
// 上游字节源可以是进程自身的标准输入，也可以是可重复打开的命名端点
// （通常是FIFO）。本模块负责解析、创建和打开这些端点。

use crate::error::{CaptureError, Result};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio::net::unix::pipe;
use tracing::debug;

/// 已打开的端点读取句柄
pub type EndpointReader = Box<dyn AsyncRead + Send + Unpin>;

/// 上游输入源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureInput {
    /// 进程标准输入，整个进程生命周期只消费一次
    Stdin,
    /// 命名端点，可以被多次打开
    Endpoint(PathBuf),
}

impl CaptureInput {
    /// 解析命令行参数，`stdin` 或 `-` 表示标准输入
    pub fn parse(value: &str) -> Self {
        match value {
            "stdin" | "-" => CaptureInput::Stdin,
            path => CaptureInput::Endpoint(PathBuf::from(path)),
        }
    }

    pub fn is_stdin(&self) -> bool {
        matches!(self, CaptureInput::Stdin)
    }
}

impl fmt::Display for CaptureInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureInput::Stdin => write!(f, "stdin"),
            CaptureInput::Endpoint(path) => write!(f, "{}", path.display()),
        }
    }
}

/// 判断路径是否为FIFO
pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

/// 确保路径上存在FIFO
///
/// 路径已存在时不做任何事（即使它不是FIFO）；新建时返回 `true`。
pub fn ensure_fifo(path: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CaptureError::InvalidParameter(format!("path contains NUL byte: {}", path.display()))
    })?;

    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let error = io::Error::last_os_error();
        // 并发创建时另一方先建好了
        if error.kind() == io::ErrorKind::AlreadyExists {
            return Ok(false);
        }
        return Err(CaptureError::FifoCreate {
            path: path.display().to_string(),
            source: error,
        });
    }

    debug!("Created FIFO: {}", path.display());
    Ok(true)
}

/// 打开命名端点用于读取
///
/// FIFO以非阻塞方式打开，不等待写者出现；写者离开后读取返回0字节。
/// 普通文件按 `tail -f` 的方式读取，读到末尾同样返回0字节。
pub async fn open_endpoint(path: &Path) -> Result<EndpointReader> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CaptureError::EndpointNotFound(path.display().to_string()),
        _ => CaptureError::IoError(e),
    })?;

    if metadata.file_type().is_fifo() {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        debug!("Opened FIFO endpoint: {}", path.display());
        Ok(Box::new(receiver))
    } else {
        let file = tokio::fs::File::open(path).await?;
        debug!("Opened file endpoint: {}", path.display());
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_capture_input() {
        assert_eq!(CaptureInput::parse("stdin"), CaptureInput::Stdin);
        assert_eq!(CaptureInput::parse("-"), CaptureInput::Stdin);
        assert_eq!(
            CaptureInput::parse("/tmp/tcpdump_fifo"),
            CaptureInput::Endpoint(PathBuf::from("/tmp/tcpdump_fifo"))
        );
        assert_eq!(CaptureInput::Stdin.to_string(), "stdin");
        assert!(!CaptureInput::parse("/tmp/x").is_stdin());
    }

    #[test]
    fn test_ensure_fifo_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.fifo");

        assert!(ensure_fifo(&path).unwrap());
        assert!(is_fifo(&path));
        assert!(!ensure_fifo(&path).unwrap());
    }

    #[test]
    fn test_ensure_fifo_leaves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        std::fs::write(&path, b"data").unwrap();

        assert!(!ensure_fifo(&path).unwrap());
        assert!(!is_fifo(&path));
    }

    #[test]
    fn test_ensure_fifo_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("capture.fifo");

        assert!(matches!(
            ensure_fifo(&path),
            Err(CaptureError::FifoCreate { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_missing_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_endpoint(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(CaptureError::EndpointNotFound(_))));
    }

    #[tokio::test]
    async fn test_open_regular_file_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        std::fs::write(&path, b"pcap-bytes").unwrap();

        let mut reader = open_endpoint(&path).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pcap-bytes");
    }

    #[tokio::test]
    async fn test_open_fifo_endpoint_before_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.fifo");
        ensure_fifo(&path).unwrap();

        // 打开读端不需要写者在场
        let mut reader = open_endpoint(&path).await.unwrap();
        let mut buf = [0u8; 16];

        let mut sender = pipe::OpenOptions::new().open_sender(&path).unwrap();
        sender.write_all(b"live").await.unwrap();

        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"live");

        // 写者离开后读到EOF
        drop(sender);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
