use std::fmt;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// 会话键: 决定注册表分区和产物目录名
///
/// 设备会话与临时预览会话各自实现, 两个键空间使用独立的注册表和根目录, 永不冲突。
pub trait SessionKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// 键空间标签, 同时出现在 HLS 路由中
    const SPACE: &'static str;

    /// 产物目录名, 必须是单一路径分量
    fn dir_name(&self) -> String;
}

/// 设备会话键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionKey for DeviceId {
    const SPACE: &'static str = "device";

    fn dir_name(&self) -> String {
        self.0.to_string()
    }
}

/// 临时预览会话键 (每次即席预览请求生成一个)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewToken(String);

impl PreviewToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// 校验外部传入的令牌, 只接受可以安全用作目录名的字符
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SessionKey for PreviewToken {
    const SPACE: &'static str = "preview";

    fn dir_name(&self) -> String {
        self.0.clone()
    }
}

/// 一个外部转码进程及其日志文件
///
/// 进程由本结构独占; 句柄被丢弃时进程也会被杀掉 (`kill_on_drop`)。
pub struct ProcessHandle {
    key: String,
    source_url: String,
    child: Child,
    log: Option<File>,
    output_dir: PathBuf,
    started_at: Instant,
}

impl ProcessHandle {
    /// 以追加方式打开日志文件, 把 stdout/stderr 都重定向进去, 然后启动进程
    pub fn spawn(
        cmd: &mut Command,
        key: String,
        source_url: String,
        output_dir: PathBuf,
        log_path: &Path,
    ) -> std::io::Result<Self> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        writeln!(log, "--- session {} starting, source {} ---", key, source_url)?;

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .kill_on_drop(true);

        let child = cmd.spawn()?;

        Ok(Self {
            key,
            source_url,
            child,
            log: Some(log),
            output_dir,
            started_at: Instant::now(),
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 每次都重新检查, 不缓存结果
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(key = %self.key, %status, "transcoder has exited");
                false
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to poll transcoder status");
                false
            }
        }
    }

    /// 先通过 stdin 请求 FFmpeg 正常退出, 超过 `grace` 仍未退出则强制结束
    pub async fn terminate(mut self, grace: Duration) {
        let pid = self.child.id();

        if let Some(mut stdin) = self.child.stdin.take() {
            // 进程可能已经退出, 写失败无需处理
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(key = %self.key, ?pid, %status, "transcoder stopped");
            }
            Ok(Err(e)) => {
                warn!(key = %self.key, ?pid, error = %e, "failed to wait for transcoder");
                let _ = self.child.kill().await;
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    ?pid,
                    grace_ms = grace.as_millis() as u64,
                    "transcoder ignored quit request, killing"
                );
                let _ = self.child.kill().await;
            }
        }

        self.close_log();
    }

    fn close_log(&mut self) {
        if let Some(mut log) = self.log.take() {
            let _ = writeln!(log, "--- session {} closed ---", self.key);
        }
    }
}
