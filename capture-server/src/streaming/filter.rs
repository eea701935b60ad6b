// 抓包流中继系统 - 过滤会话
//
// 每个带 filter 参数的请求启动一个外部过滤引擎进程（默认 tshark）：
//
//   engine -r - -Y <filter> -w - [-a duration:<secs>]
//
// # 特性
//
// - 输入喂送在独立任务中进行，输出读取在中继任务中进行，两者互不阻塞
// - stderr 在整个会话期间持续读取，引擎不会因为stderr管道写满而卡住
// - 引擎进程退出或 stdout 读到EOF即结束，退出前刷出的输出仍会被转发
// - 结束帧先于引擎回收写出，回收耗时不影响客户端
// - 结束时先发送SIGTERM，宽限期内未退出再强制杀死

use super::error::StreamError;
use super::relay::{RelayContext, RelayEnd};
use super::source::ChunkSource;
use bytes::Bytes;
use common::IDLE_POLL_INTERVAL;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 保留的stderr输出上限
const STDERR_LIMIT: usize = 64 * 1024;

/// 过滤引擎配置
#[derive(Debug, Clone)]
pub struct FilterEngine {
    program: PathBuf,
    grace_period: Duration,
}

impl FilterEngine {
    pub fn new(program: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            program: program.into(),
            grace_period,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// 引擎命令行参数
    ///
    /// 引擎的自限时长只接受整数秒，向上取整且至少1秒；
    /// 精确的截止时间由中继任务负责。
    pub fn args(filter: &str, duration: Option<Duration>) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            "-".to_string(),
            "-Y".to_string(),
            filter.to_string(),
            "-w".to_string(),
            "-".to_string(),
        ];

        if let Some(duration) = duration {
            let secs = (duration.as_secs_f64().ceil() as u64).max(1);
            args.push("-a".to_string());
            args.push(format!("duration:{}", secs));
        }

        args
    }

    /// 启动引擎进程
    ///
    /// 可执行文件不存在时返回 `EngineNotFound`，其余启动失败返回 `EngineSpawn`。
    pub fn spawn(
        &self,
        filter: &str,
        duration: Option<Duration>,
        session_id: Uuid,
    ) -> Result<FilterSession, StreamError> {
        let program = self.program.display().to_string();
        let args = Self::args(filter, duration);

        info!("[{}] Starting filter engine: {} {}", session_id, program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::from_spawn_error(&program, e))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdin, stdout, stderr) = match (stdin, stdout, stderr) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(StreamError::EngineSpawn(format!(
                    "{}: failed to capture stdio pipes",
                    program
                )));
            }
        };

        debug!("[{}] Filter engine started (pid {:?})", session_id, child.id());

        Ok(FilterSession {
            session_id,
            child,
            stdin,
            stdout,
            stderr_task: tokio::spawn(drain_stderr(stderr)),
            grace_period: self.grace_period,
        })
    }
}

/// 一个请求独占的过滤引擎进程
pub struct FilterSession {
    session_id: Uuid,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr_task: JoinHandle<String>,
    grace_period: Duration,
}

impl FilterSession {
    /// 运行过滤会话，直到引擎退出或中继结束
    ///
    /// 输出循环结束后立即关闭响应通道（写出结束帧），之后才终止并回收引擎；
    /// 返回时引擎进程已退出（或已被强制杀死）。
    pub async fn run(self, source: Box<dyn ChunkSource>, ctx: RelayContext) -> RelayEnd {
        let FilterSession {
            session_id,
            mut child,
            stdin,
            mut stdout,
            stderr_task,
            grace_period,
        } = self;

        let feed_cancel = CancellationToken::new();
        let feed = tokio::spawn(feed_engine(
            source,
            stdin,
            ctx.chunk_size(),
            feed_cancel.clone(),
            session_id,
        ));

        let end = drain_output(&mut stdout, &mut child, &ctx).await;
        let _session = ctx.close(end);

        if end != RelayEnd::EngineExited {
            terminate(&child, session_id);
        }

        // 停止喂送，关闭引擎的stdin
        feed_cancel.cancel();
        if let Err(e) = feed.await {
            warn!("[{}] Feed task failed: {}", session_id, e);
        }

        reap(&mut child, grace_period, session_id).await;

        match tokio::time::timeout(grace_period, stderr_task).await {
            Ok(Ok(output)) if !output.trim().is_empty() => {
                info!("[{}] Filter engine stderr: {}", session_id, output.trim());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("[{}] Stderr drain task failed: {}", session_id, e),
            Err(_) => warn!("[{}] Filter engine stderr still open after exit", session_id),
        }

        end
    }
}

/// 输出循环的一步
enum EngineEvent {
    Output(io::Result<usize>),
    Exited(io::Result<ExitStatus>),
}

/// 把引擎输出转发到响应通道
///
/// 引擎进程退出即结束，即使它留下的子进程仍持有stdout；
/// 退出时管道里已有的输出会先转发完。
async fn drain_output(stdout: &mut ChildStdout, child: &mut Child, ctx: &RelayContext) -> RelayEnd {
    let mut buffer = vec![0u8; ctx.chunk_size()];

    loop {
        let event = tokio::select! {
            end = ctx.interrupted() => return end,
            read = stdout.read(&mut buffer) => EngineEvent::Output(read),
            status = child.wait() => EngineEvent::Exited(status),
        };

        match event {
            EngineEvent::Output(Ok(0)) => return RelayEnd::EngineExited,
            EngineEvent::Output(Ok(n)) => {
                if let Err(end) = ctx.send(Bytes::copy_from_slice(&buffer[..n])).await {
                    return end;
                }
            }
            EngineEvent::Output(Err(e)) => {
                warn!("[{}] Filter engine output error: {}", ctx.session().id(), e);
                return RelayEnd::EngineExited;
            }
            EngineEvent::Exited(status) => {
                match status {
                    Ok(status) => debug!("[{}] Filter engine exited: {}", ctx.session().id(), status),
                    Err(e) => warn!("[{}] Failed to wait for filter engine: {}", ctx.session().id(), e),
                }
                return drain_remaining(stdout, &mut buffer, ctx).await;
            }
        }
    }
}

/// 引擎退出后转发管道中剩余的输出，空闲片刻即停止
async fn drain_remaining(
    stdout: &mut ChildStdout,
    buffer: &mut [u8],
    ctx: &RelayContext,
) -> RelayEnd {
    loop {
        let read = tokio::select! {
            read = stdout.read(buffer) => read,
            _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => return RelayEnd::EngineExited,
        };

        match read {
            Ok(0) | Err(_) => return RelayEnd::EngineExited,
            Ok(n) => {
                if let Err(end) = ctx.send(Bytes::copy_from_slice(&buffer[..n])).await {
                    return end;
                }
            }
        }
    }
}

/// 喂送任务：把输入源的数据写入引擎stdin
///
/// 任务结束时 `stdin` 被drop，引擎随之读到EOF。
async fn feed_engine(
    mut source: Box<dyn ChunkSource>,
    mut stdin: ChildStdin,
    chunk_size: usize,
    cancel: CancellationToken,
    session_id: Uuid,
) {
    let mut buffer = vec![0u8; chunk_size];
    let mut fed: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = source.read_chunk(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
            }
            Ok(n) => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = stdin.write_all(&buffer[..n]) => written,
                };
                if let Err(e) = written {
                    debug!("[{}] Filter engine stopped accepting input: {}", session_id, e);
                    break;
                }
                fed += n as u64;
            }
            Err(e) => {
                warn!("[{}] Input read error: {}", session_id, e);
                break;
            }
        }
    }

    debug!("[{}] Feed task stopped ({} bytes fed)", session_id, fed);
}

/// 持续读取stderr，只保留前 `STDERR_LIMIT` 字节
async fn drain_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buffer = [0u8; 4096];

    loop {
        match stderr.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&buffer[..n.min(room)]);
            }
        }
    }

    String::from_utf8_lossy(&kept).into_owned()
}

/// 请求引擎退出（SIGTERM）
fn terminate(child: &Child, session_id: Uuid) {
    if let Some(pid) = child.id() {
        debug!("[{}] Sending SIGTERM to filter engine (pid {})", session_id, pid);
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "[{}] Failed to send SIGTERM to filter engine (pid {}): {}",
                session_id,
                pid,
                io::Error::last_os_error()
            );
        }
    }
}

/// 等待引擎退出，超过宽限期则强制杀死
async fn reap(child: &mut Child, grace_period: Duration, session_id: Uuid) {
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => debug!("[{}] Filter engine exited: {}", session_id, status),
        Ok(Err(e)) => warn!("[{}] Failed to wait for filter engine: {}", session_id, e),
        Err(_) => {
            warn!(
                "[{}] Filter engine did not exit within {:?}, killing",
                session_id, grace_period
            );
            if let Err(e) = child.kill().await {
                warn!("[{}] Failed to kill filter engine: {}", session_id, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::streaming::relay::RELAY_CHANNEL_CAPACITY;
    use crate::streaming::request::StreamRequest;
    use crate::streaming::session::SessionRegistry;
    use crate::streaming::source::SharedInput;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// 写出一个可执行的shell脚本充当过滤引擎
    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context(
        registry: &SessionRegistry,
        deadline: Option<Instant>,
    ) -> (RelayContext, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let request = StreamRequest {
            filter: Some("tcp".to_string()),
            duration: None,
        };
        let ctx = RelayContext::new(
            tx,
            deadline,
            1024,
            registry.register(&request),
            CancellationToken::new(),
        );
        (ctx, rx)
    }

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.extend_from_slice(&chunk);
        }
        received
    }

    #[test]
    fn test_engine_args() {
        assert_eq!(
            FilterEngine::args("tcp port 80", None),
            vec!["-r", "-", "-Y", "tcp port 80", "-w", "-"]
        );
        assert_eq!(
            FilterEngine::args("udp", Some(Duration::from_millis(2500))),
            vec!["-r", "-", "-Y", "udp", "-w", "-", "-a", "duration:3"]
        );
        assert_eq!(
            FilterEngine::args("udp", Some(Duration::from_millis(100))),
            vec!["-r", "-", "-Y", "udp", "-w", "-", "-a", "duration:1"]
        );
    }

    #[tokio::test]
    async fn test_missing_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FilterEngine::new(dir.path().join("no-such-engine"), Duration::from_secs(2));

        let result = engine.spawn("tcp", None, Uuid::new_v4());
        assert!(matches!(result, Err(StreamError::EngineNotFound(_))));
    }

    #[tokio::test]
    async fn test_engine_exit_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "head-engine", "exec head -c 5");
        let engine = FilterEngine::new(script, Duration::from_secs(2));

        let (mut producer, consumer) = tokio::io::duplex(64);
        producer.write_all(b"abcdefghij").await.unwrap();
        let source: Box<dyn ChunkSource> = Box::new(SharedInput::from_reader(Box::new(consumer)));

        let registry = SessionRegistry::new();
        let (ctx, rx) = context(&registry, None);
        let id = ctx.session().id();
        let session = engine.spawn("tcp", None, id).unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), session.run(source, ctx))
            .await
            .unwrap();
        assert_eq!(end, RelayEnd::EngineExited);

        assert_eq!(collect(rx).await, b"abcde");
    }

    #[tokio::test]
    async fn test_deadline_terminates_engine() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat-engine", "exec cat");
        let engine = FilterEngine::new(script, Duration::from_secs(2));

        let (mut producer, consumer) = tokio::io::duplex(64);
        producer.write_all(b"filtered").await.unwrap();
        let source: Box<dyn ChunkSource> = Box::new(SharedInput::from_reader(Box::new(consumer)));

        let registry = SessionRegistry::new();
        let started = Instant::now();
        let (ctx, rx) = context(&registry, Some(started + Duration::from_millis(300)));
        let id = ctx.session().id();
        let session = engine.spawn("tcp", None, id).unwrap();

        let end = session.run(source, ctx).await;
        assert_eq!(end, RelayEnd::DeadlineReached);
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(collect(rx).await, b"filtered");
    }

    #[tokio::test]
    async fn test_stream_closes_before_stubborn_engine_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        // 忽略SIGTERM，stdin关闭后仍继续运行，只能在宽限期后被强制杀死
        let script = write_script(dir.path(), "stubborn-engine", "trap '' TERM\ncat\nsleep 10");
        let engine = FilterEngine::new(script, Duration::from_secs(3));

        let (mut producer, consumer) = tokio::io::duplex(64);
        producer.write_all(b"filtered").await.unwrap();
        let source: Box<dyn ChunkSource> = Box::new(SharedInput::from_reader(Box::new(consumer)));

        let registry = SessionRegistry::new();
        let started = Instant::now();
        let (ctx, rx) = context(&registry, Some(started + Duration::from_millis(300)));
        let id = ctx.session().id();
        let session = engine.spawn("tcp", None, id).unwrap();

        let run = tokio::spawn(session.run(source, ctx));

        // 响应通道在截止时间后立即关闭，不等待引擎回收
        let received = tokio::time::timeout(Duration::from_secs(2), collect(rx))
            .await
            .unwrap();
        assert_eq!(received, b"filtered");
        assert!(started.elapsed() < Duration::from_millis(1500));

        // 回收期间会话仍然登记
        assert_eq!(registry.active_sessions(), 1);

        let end = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, RelayEnd::DeadlineReached);
        assert_eq!(registry.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_engine_exit_ends_session_despite_background_child() {
        let dir = tempfile::tempdir().unwrap();
        // 后台子进程继承stdout，引擎退出后管道不会马上EOF
        let script = write_script(dir.path(), "forking-engine", "head -c 4\n(sleep 8) &\nexit 0");
        let engine = FilterEngine::new(script, Duration::from_millis(500));

        let (mut producer, consumer) = tokio::io::duplex(64);
        producer.write_all(b"abcdefgh").await.unwrap();
        let source: Box<dyn ChunkSource> = Box::new(SharedInput::from_reader(Box::new(consumer)));

        let registry = SessionRegistry::new();
        let (ctx, rx) = context(&registry, None);
        let id = ctx.session().id();
        let session = engine.spawn("tcp", None, id).unwrap();

        let started = Instant::now();
        let run = tokio::spawn(session.run(source, ctx));

        let received = tokio::time::timeout(Duration::from_secs(3), collect(rx))
            .await
            .unwrap();
        assert_eq!(received, b"abcd");
        assert!(started.elapsed() < Duration::from_secs(3));

        let end = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, RelayEnd::EngineExited);
    }

    #[tokio::test]
    async fn test_client_disconnect_reaps_engine() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat-engine", "exec cat");
        let engine = FilterEngine::new(script, Duration::from_secs(2));

        let (_producer, consumer) = tokio::io::duplex(64);
        let source: Box<dyn ChunkSource> = Box::new(SharedInput::from_reader(Box::new(consumer)));

        let registry = SessionRegistry::new();
        let (ctx, rx) = context(&registry, None);
        let id = ctx.session().id();
        let session = engine.spawn("tcp", None, id).unwrap();
        let pid = session.child.id().unwrap() as libc::pid_t;

        drop(rx);

        let end = tokio::time::timeout(Duration::from_secs(5), session.run(source, ctx))
            .await
            .unwrap();
        assert_eq!(end, RelayEnd::ClientDisconnected);
        assert_eq!(registry.active_sessions(), 0);

        // 进程已被回收，pid不再存在
        let rc = unsafe { libc::kill(pid, 0) };
        assert_ne!(rc, 0);
    }
}
