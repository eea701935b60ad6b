use anyhow::{bail, Result};
use clap::Parser;
use common::{CaptureInput, DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};
use std::path::PathBuf;

/// 命名管道缓冲进程
///
/// 持续读取上游FIFO写入环形缓冲区，再从缓冲区写往下游FIFO，
/// 没有消费者时上游抓包进程也不会被阻塞或终止。
#[derive(Debug, Clone, Parser)]
#[command(name = "pipe-buffer", version, about)]
pub struct Config {
    /// 上游输入：FIFO路径，或 `stdin`
    #[arg(value_name = "INPUT")]
    pub input: String,

    /// 下游输出FIFO路径（不存在时自动创建）
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// 环形缓冲区容量（字节）
    #[arg(long, env = "PIPE_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// 单次读写的分块大小（字节）
    #[arg(long, env = "PIPE_BUFFER_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn input_source(&self) -> CaptureInput {
        CaptureInput::parse(&self.input)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            bail!("--buffer-size must be positive");
        }
        if self.chunk_size == 0 {
            bail!("--chunk-size must be positive");
        }
        if let CaptureInput::Endpoint(path) = self.input_source() {
            if !path.exists() {
                bail!(
                    "Input pipe '{}' does not exist (create it with: mkfifo {})",
                    path.display(),
                    path.display()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = Config::try_parse_from(["pipe-buffer", "stdin", "/tmp/out.fifo"]).unwrap();

        assert_eq!(config.input_source(), CaptureInput::Stdin);
        assert_eq!(config.output, PathBuf::from("/tmp/out.fifo"));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_requires_both_pipes() {
        assert!(Config::try_parse_from(["pipe-buffer", "/tmp/in.fifo"]).is_err());
    }

    #[test]
    fn test_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.fifo");
        let config = Config::try_parse_from([
            std::ffi::OsStr::new("pipe-buffer"),
            missing.as_os_str(),
            dir.path().join("out.fifo").as_os_str(),
        ])
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let config = Config::try_parse_from([
            "pipe-buffer",
            "stdin",
            "/tmp/out.fifo",
            "--buffer-size",
            "0",
        ])
        .unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from([
            "pipe-buffer",
            "stdin",
            "/tmp/out.fifo",
            "--chunk-size",
            "0",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
