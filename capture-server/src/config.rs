use anyhow::{bail, Result};
use clap::Parser;
use common::{CaptureInput, DEFAULT_CHUNK_SIZE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// 抓包流HTTP服务器
///
/// 通过 `/stream` 把实时抓包数据以分块传输的方式推送给客户端，
/// 可选按显示过滤器过滤。
#[derive(Debug, Clone, Parser)]
#[command(name = "capture-server", version, about)]
pub struct Config {
    /// 监听地址
    #[arg(long, env = "CAPTURE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// 监听端口
    #[arg(long, env = "CAPTURE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// 上游输入：FIFO或文件路径，或 `stdin`
    #[arg(long, env = "CAPTURE_INPUT", default_value = "/tmp/tcpdump_fifo")]
    pub input: String,

    /// 过滤引擎可执行文件
    #[arg(long, env = "CAPTURE_ENGINE", default_value = "tshark")]
    pub engine: PathBuf,

    /// 过滤引擎收到SIGTERM后的退出宽限期（秒）
    #[arg(long, env = "CAPTURE_ENGINE_GRACE_SECS", default_value_t = 2)]
    pub engine_grace_secs: u64,

    /// 中继分块大小（字节）
    #[arg(long, env = "CAPTURE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
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

    pub fn engine_grace_period(&self) -> Duration {
        Duration::from_secs(self.engine_grace_secs)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("--chunk-size must be positive");
        }
        self.listen_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = Config::try_parse_from(["capture-server"]).unwrap();

        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8000");
        assert_eq!(
            config.input_source(),
            CaptureInput::Endpoint(PathBuf::from("/tmp/tcpdump_fifo"))
        );
        assert_eq!(config.engine, PathBuf::from("tshark"));
        assert_eq!(config.engine_grace_period(), Duration::from_secs(2));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_stdin_input() {
        let config =
            Config::try_parse_from(["capture-server", "--input", "stdin", "--port", "9000"])
                .unwrap();

        assert!(config.input_source().is_stdin());
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config =
            Config::try_parse_from(["capture-server", "--chunk-size", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config =
            Config::try_parse_from(["capture-server", "--host", "not a host"]).unwrap();
        assert!(config.validate().is_err());
    }
}
