//! HLS 产物目录约定
//!
//! ```text
//! <root>/<key>/index.m3u8       清单, 由转码器维护
//! <root>/<key>/segment_NNN.ts   滚动切片窗口, 由转码器自行清理
//! <root>/<key>/transcoder.log   转码器 stdout/stderr
//! ```

use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const MANIFEST_FILE: &str = "index.m3u8";
pub const LOG_FILE: &str = "transcoder.log";
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXT: &str = ".ts";

/// 读日志尾部时最多回看的字节数
const LOG_TAIL_WINDOW: u64 = 16 * 1024;

pub fn is_segment_name(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_EXT)
}

/// 只允许单一路径分量的文件名, 防止目录穿越
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// 创建会话目录并清掉上一轮留下的清单和切片
///
/// 日志文件保留, 新进程以追加方式继续写入。
pub async fn prepare_session_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == MANIFEST_FILE || is_segment_name(&name) || name.ends_with(".tmp") {
            let _ = fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

/// 某一时刻会话目录的状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactState {
    pub manifest_exists: bool,
    pub segment_count: usize,
    pub newest_segment: Option<PathBuf>,
    pub newest_segment_age: Option<Duration>,
}

pub async fn inspect(dir: &Path, now: SystemTime) -> ArtifactState {
    let mut state = ArtifactState {
        manifest_exists: fs::try_exists(dir.join(MANIFEST_FILE)).await.unwrap_or(false),
        ..Default::default()
    };

    let Ok(mut entries) = fs::read_dir(dir).await else {
        return state;
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !is_segment_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        state.segment_count += 1;

        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    if let Some((modified, path)) = newest {
        // 时钟回拨时按刚写入处理
        state.newest_segment_age = Some(now.duration_since(modified).unwrap_or_default());
        state.newest_segment = Some(path);
    }
    state
}

/// 进程存活情况, 由注册表给出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    NotStarted,
    Exited,
    Running,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub running: bool,
    pub error: Option<String>,
    pub hls_exists: bool,
    pub seconds_since_last_segment: Option<f64>,
}

impl HealthReport {
    pub fn evaluate(liveness: Liveness, artifacts: &ArtifactState, stale_after: Duration) -> Self {
        let running = liveness == Liveness::Running;
        let error = match liveness {
            Liveness::NotStarted => Some("stream not started"),
            Liveness::Exited => Some("process exited"),
            Liveness::Running if !artifacts.manifest_exists => Some("initializing"),
            Liveness::Running if artifacts.segment_count == 0 => Some("no video data"),
            Liveness::Running => match artifacts.newest_segment_age {
                Some(age) if age > stale_after => Some("stream stalled"),
                _ => None,
            },
        };

        Self {
            healthy: error.is_none(),
            running,
            error: error.map(str::to_string),
            hls_exists: artifacts.manifest_exists,
            seconds_since_last_segment: artifacts.newest_segment_age.map(|age| age.as_secs_f64()),
        }
    }
}

/// 读取日志最后 `lines` 行, 文件不存在时返回空串
pub async fn read_log_tail(path: &Path, lines: usize) -> String {
    let Ok(mut file) = fs::File::open(path).await else {
        return String::new();
    };

    let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(LOG_TAIL_WINDOW);
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return String::new();
    }

    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    // 从窗口中间截断时丢掉第一行残片
    let skip_partial = usize::from(start > 0 && all.len() > lines);
    let from = all.len().saturating_sub(lines).max(skip_partial);
    all[from..].join("\n")
}

/// 把清单中的切片引用改写为经本服务路由的绝对地址
pub fn rewrite_manifest(manifest: &str, segment_base: &str) -> String {
    let base = segment_base.trim_end_matches('/');
    let mut out = String::with_capacity(manifest.len() + 64);

    for line in manifest.lines() {
        let trimmed = line.trim();
        let is_reference =
            !trimmed.is_empty() && !trimmed.starts_with('#') && !trimmed.contains("://");

        if is_reference {
            // FFmpeg 可能写入完整路径, 只取文件名
            let name = Path::new(trimmed)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| trimmed.to_string());
            out.push_str(base);
            out.push('/');
            out.push_str(&name);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}
