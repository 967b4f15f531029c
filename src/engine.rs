use crate::artifacts::{self, HealthReport, Liveness, LOG_FILE, MANIFEST_FILE};
use crate::config::ServerConfig;
use crate::error::{Result, StreamError};
use crate::registry::SessionRegistry;
use crate::session::{ProcessHandle, SessionKey};
use crate::transcoder::{self, HlsOptions, SourceKind};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// 清单等待的轮询间隔
const MANIFEST_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// 失败诊断中附带的日志行数
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ffmpeg_binary: String,
    pub hls: HlsOptions,
    pub manifest_wait: Duration,
    pub stop_grace: Duration,
    pub stale_after: Duration,
    pub min_free_memory_kb: u64,
}

impl EngineSettings {
    pub fn from_server(cfg: &ServerConfig) -> Self {
        Self {
            ffmpeg_binary: cfg.ffmpeg_binary.clone(),
            hls: HlsOptions {
                segment_seconds: cfg.segment_seconds,
                playlist_size: cfg.playlist_size,
            },
            manifest_wait: Duration::from_millis(cfg.manifest_wait_ms),
            stop_grace: Duration::from_millis(cfg.stop_grace_ms),
            stale_after: Duration::from_secs(cfg.stale_segment_secs),
            min_free_memory_kb: cfg.min_free_memory_kb,
        }
    }
}

/// 清单所在位置; 只是路径计算, 不代表流正在运行
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestRef {
    pub space: &'static str,
    pub key: String,
    /// 经 HTTP 访问的相对地址
    pub url: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub space: &'static str,
    pub key: String,
    pub source_url: String,
    pub output_dir: String,
    pub pid: Option<u32>,
    pub uptime_seconds: u64,
    pub running: bool,
}

/// 流会话监管器: 每个会话键至多一个存活的转码进程
///
/// 设备会话和临时预览会话各自持有一个实例, 根目录不同。
pub struct Engine<K: SessionKey> {
    registry: SessionRegistry<K>,
    root: PathBuf,
    settings: EngineSettings,
}

impl<K: SessionKey> Engine<K> {
    pub fn new(root: impl Into<PathBuf>, settings: EngineSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            root: root.into(),
            settings,
        }
    }

    pub fn session_dir(&self, key: &K) -> PathBuf {
        self.root.join(key.dir_name())
    }

    pub fn manifest_ref(&self, key: &K) -> ManifestRef {
        let key_dir = key.dir_name();
        ManifestRef {
            space: K::SPACE,
            url: format!("/hls/{}/{}/{}", K::SPACE, key_dir, MANIFEST_FILE),
            path: self.root.join(&key_dir).join(MANIFEST_FILE),
            key: key_dir,
        }
    }

    /// 启动 (或复用) 指定会话的转码进程
    ///
    /// # 行为
    /// - 已有存活进程且地址未变: 直接返回, 不启动新进程
    /// - 进程已退出或地址变化: 先完整终止旧进程再启动
    ///
    /// # 错误处理
    /// - 找不到转码程序时返回 `TranscoderUnavailable`, 不登记句柄
    /// - 可用内存不足时拒绝启动
    pub async fn start(&self, key: &K, source_url: &str) -> Result<ManifestRef> {
        let kind = SourceKind::classify(source_url)?;
        let source_url = source_url.trim();

        // 1. 锁定该键, 复用/替换的判断和进程启动是原子的
        let mut slot = self.registry.slot(key).await;

        if let Some(running) = slot.get() {
            if running.is_alive() && running.source_url() == source_url {
                debug!(space = K::SPACE, %key, "reusing running transcoder");
                return Ok(self.manifest_ref(key));
            }
        }

        // 2. 旧进程已退出或地址变化, 先拆除
        if let Some(mut previous) = slot.take() {
            let reason = if previous.is_alive() {
                "source url changed"
            } else {
                "process exited"
            };
            info!(space = K::SPACE, %key, reason, "replacing transcoder");
            previous.terminate(self.settings.stop_grace).await;
        }

        // 3. 检查系统内存是否足够
        self.check_memory()?;

        // 4. 准备 HLS 输出目录
        let output_dir = self.session_dir(key);
        artifacts::prepare_session_dir(&output_dir).await?;

        // 5. 构建 FFmpeg 命令并启动子进程
        let args = transcoder::hls_args(kind, source_url, &output_dir, &self.settings.hls);
        let mut cmd = transcoder::command(&self.settings.ffmpeg_binary, &args);
        let log_path = output_dir.join(LOG_FILE);

        let handle = match ProcessHandle::spawn(
            &mut cmd,
            key.to_string(),
            source_url.to_string(),
            output_dir.clone(),
            &log_path,
        ) {
            Ok(handle) => handle,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                error!(
                    binary = %self.settings.ffmpeg_binary,
                    error = %e,
                    "failed to spawn transcoder"
                );
                return Err(StreamError::TranscoderUnavailable {
                    binary: self.settings.ffmpeg_binary.clone(),
                    log_tail: artifacts::read_log_tail(&log_path, LOG_TAIL_LINES).await,
                });
            }
            Err(e) => {
                error!(space = K::SPACE, %key, error = %e, "failed to spawn transcoder");
                return Err(e.into());
            }
        };

        info!(
            space = K::SPACE,
            %key,
            pid = ?handle.pid(),
            source = %source_url,
            "transcoder started, HLS output {:?}",
            output_dir
        );

        // 6. 登记句柄
        if let Some(stale) = slot.put(handle) {
            stale.terminate(self.settings.stop_grace).await;
        }

        Ok(self.manifest_ref(key))
    }

    /// 停止会话; 不存在时返回 false
    pub async fn stop(&self, key: &K) -> bool {
        let mut slot = self.registry.slot(key).await;
        match slot.take() {
            Some(handle) => {
                handle.terminate(self.settings.stop_grace).await;
                info!(space = K::SPACE, %key, "stream stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, key: &K) -> bool {
        self.liveness(key).await == Liveness::Running
    }

    pub async fn pid(&self, key: &K) -> Option<u32> {
        let mut slot = self.registry.slot(key).await;
        slot.get().and_then(|handle| handle.pid())
    }

    async fn liveness(&self, key: &K) -> Liveness {
        let mut slot = self.registry.slot(key).await;
        let Some(handle) = slot.get() else {
            return Liveness::NotStarted;
        };
        if handle.is_alive() {
            Liveness::Running
        } else {
            Liveness::Exited
        }
    }

    pub async fn health(&self, key: &K) -> HealthReport {
        let liveness = self.liveness(key).await;
        let state = artifacts::inspect(&self.session_dir(key), SystemTime::now()).await;
        HealthReport::evaluate(liveness, &state, self.settings.stale_after)
    }

    /// 轮询等待清单出现
    ///
    /// 超时只影响调用方, 进程继续在后台运行; 进程提前退出时立即失败。
    pub async fn wait_for_manifest(&self, key: &K, timeout: Duration) -> Result<ManifestRef> {
        let manifest = self.manifest_ref(key);
        let started = Instant::now();
        let mut logged = false;

        loop {
            if tokio::fs::try_exists(&manifest.path).await.unwrap_or(false) {
                return Ok(manifest);
            }

            if !self.is_running(key).await {
                warn!(space = K::SPACE, %key, "transcoder exited before manifest appeared");
                return Err(StreamError::ProcessExited {
                    log_tail: self.log_tail(key, LOG_TAIL_LINES).await,
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(
                    space = K::SPACE,
                    %key,
                    waited_ms = waited.as_millis() as u64,
                    "manifest not ready, leaving transcoder running"
                );
                return Err(StreamError::ManifestTimeout {
                    waited_ms: waited.as_millis() as u64,
                    log_tail: self.log_tail(key, LOG_TAIL_LINES).await,
                });
            }

            if !logged {
                info!("Waiting for HLS generation: {:?}", manifest.path);
                logged = true;
            }
            tokio::time::sleep(MANIFEST_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// HTTP 启动流程: 启动后在配置的时限内等待清单
    pub async fn start_and_wait(&self, key: &K, source_url: &str) -> Result<ManifestRef> {
        self.start(key, source_url).await?;
        self.wait_for_manifest(key, self.settings.manifest_wait).await
    }

    pub async fn log_tail(&self, key: &K, lines: usize) -> String {
        artifacts::read_log_tail(&self.session_dir(key).join(LOG_FILE), lines).await
    }

    pub async fn latest_segment(&self, key: &K) -> Option<PathBuf> {
        artifacts::inspect(&self.session_dir(key), SystemTime::now())
            .await
            .newest_segment
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        for key in self.registry.keys() {
            let mut slot = self.registry.slot(&key).await;
            if let Some(handle) = slot.get() {
                sessions.push(SessionInfo {
                    space: K::SPACE,
                    key: key.to_string(),
                    source_url: handle.source_url().to_string(),
                    output_dir: handle.output_dir().display().to_string(),
                    pid: handle.pid(),
                    uptime_seconds: handle.uptime().as_secs(),
                    running: handle.is_alive(),
                });
            }
        }
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// 退出前拆除全部会话
    pub async fn shutdown(&self) {
        if self.registry.is_empty() {
            return;
        }
        info!(space = K::SPACE, sessions = self.registry.len(), "stopping all sessions");
        for key in self.registry.keys() {
            self.stop(&key).await;
        }
    }

    fn check_memory(&self) -> Result<()> {
        if self.settings.min_free_memory_kb == 0 {
            return Ok(());
        }
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < self.settings.min_free_memory_kb => {
                Err(StreamError::InsufficientMemory {
                    available_kb: mem.avail,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // 无法获取内存信息时仅记录警告, 不阻断流程
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::session::{DeviceId, PreviewToken};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;

    /// 写一个冒充 FFmpeg 的脚本: 最后一个参数是清单路径
    pub(crate) fn fake_transcoder(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        // 避免并发 fork 仍持有写句柄导致 ETXTBSY
        std::thread::sleep(Duration::from_millis(100));
        path.to_string_lossy().into_owned()
    }

    /// 写出清单和一个切片, 然后常驻
    pub(crate) const PRODUCING: &str = r##"for last; do :; done
dir=$(dirname "$last")
echo "#EXTM3U" > "$last"
: > "$dir/segment_000.ts"
exec sleep 30"##;

    /// 常驻但不产生任何产物
    pub(crate) const SILENT: &str = "exec sleep 30";

    /// 打印错误后立即退出
    pub(crate) const FAILING: &str = r#"echo "Connection refused" >&2
exit 1"#;

    pub(crate) fn settings(binary: String) -> EngineSettings {
        EngineSettings {
            ffmpeg_binary: binary,
            hls: HlsOptions {
                segment_seconds: 2,
                playlist_size: 5,
            },
            manifest_wait: Duration::from_secs(5),
            stop_grace: Duration::from_millis(200),
            stale_after: Duration::from_secs(10),
            min_free_memory_kb: 0,
        }
    }

    fn engine<K: SessionKey>(dir: &tempfile::TempDir, body: &str) -> Engine<K> {
        let binary = fake_transcoder(dir.path(), "fake-ffmpeg", body);
        Engine::new(dir.path().join("hls"), settings(binary))
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine::<DeviceId>(&dir, SILENT));
        let key = DeviceId(9);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine.start(&key, "rtsp://cam/feed").await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(engine.sessions().await.len(), 1);
        assert!(engine.is_running(&key).await);

        let log = std::fs::read_to_string(engine.session_dir(&key).join(LOG_FILE)).unwrap();
        assert_eq!(log.matches("starting").count(), 1);

        assert!(engine.stop(&key).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, SILENT);

        assert!(!engine.stop(&DeviceId(1)).await);

        engine.start(&DeviceId(1), "rtsp://cam/feed").await.unwrap();
        assert!(engine.stop(&DeviceId(1)).await);
        assert!(!engine.stop(&DeviceId(1)).await);
        assert!(!engine.is_running(&DeviceId(1)).await);
    }

    #[tokio::test]
    async fn url_change_restarts_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, SILENT);
        let key = DeviceId(3);

        engine.start(&key, "rtsp://cam/one").await.unwrap();
        let first = engine.pid(&key).await.unwrap();

        // 相同地址复用
        engine.start(&key, "rtsp://cam/one").await.unwrap();
        assert_eq!(engine.pid(&key).await, Some(first));

        engine.start(&key, "rtsp://cam/two").await.unwrap();
        let second = engine.pid(&key).await.unwrap();
        assert_ne!(first, second);

        let sessions = engine.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source_url, "rtsp://cam/two");

        let log = std::fs::read_to_string(engine.session_dir(&key).join(LOG_FILE)).unwrap();
        assert_eq!(log.matches("closed").count(), 1);

        engine.stop(&key).await;
    }

    #[tokio::test]
    async fn exited_process_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, FAILING);
        let key = DeviceId(4);

        engine.start(&key, "rtsp://cam/feed").await.unwrap();
        let first = engine.pid(&key).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!engine.is_running(&key).await);
        assert_eq!(
            engine.health(&key).await.error.as_deref(),
            Some("process exited")
        );

        engine.start(&key, "rtsp://cam/feed").await.unwrap();
        let second = engine.pid(&key).await;
        assert!(second.is_some());
        assert_ne!(first, second);

        engine.stop(&key).await;
    }

    #[tokio::test]
    async fn early_exit_surfaces_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, FAILING);

        let err = engine
            .start_and_wait(&DeviceId(5), "rtsp://cam/feed")
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::ProcessExited { .. }));
        assert!(err.log_tail().contains("Connection refused"));
    }

    #[tokio::test]
    async fn manifest_timeout_leaves_process_running() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, SILENT);
        let key = DeviceId(6);

        engine.start(&key, "rtsp://cam/feed").await.unwrap();
        let err = engine
            .wait_for_manifest(&key, Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::ManifestTimeout { .. }));
        assert!(engine.is_running(&key).await);
        assert_eq!(engine.health(&key).await.error.as_deref(), Some("initializing"));

        engine.stop(&key).await;
    }

    #[tokio::test]
    async fn missing_binary_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine: Engine<DeviceId> = Engine::new(
            dir.path().join("hls"),
            settings(dir.path().join("no-such-ffmpeg").to_string_lossy().into_owned()),
        );

        let err = engine.start(&DeviceId(1), "rtsp://cam/feed").await.unwrap_err();
        assert!(matches!(err, StreamError::TranscoderUnavailable { .. }));
        assert!(!engine.is_running(&DeviceId(1)).await);
        assert!(engine.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_source_is_rejected_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, SILENT);

        let err = engine.start(&DeviceId(1), "").await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidSource(_)));
        assert!(!dir.path().join("hls").join("1").exists());
    }

    #[tokio::test]
    async fn start_health_stop_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<DeviceId>(&dir, PRODUCING);
        let key = DeviceId(42);

        let manifest = engine.start_and_wait(&key, "rtsp://cam/feed").await.unwrap();
        assert_eq!(manifest.url, "/hls/device/42/index.m3u8");
        assert!(engine.is_running(&key).await);

        let mut healthy = false;
        for _ in 0..25 {
            if engine.health(&key).await.healthy {
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(healthy);
        assert!(engine.latest_segment(&key).await.is_some());

        assert!(engine.stop(&key).await);
        assert!(!engine.is_running(&key).await);
        assert!(!engine.registry.contains_key(&key));
        assert_eq!(
            engine.health(&key).await.error.as_deref(),
            Some("stream not started")
        );
    }

    #[tokio::test]
    async fn preview_sessions_use_their_own_space() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine::<PreviewToken>(&dir, PRODUCING);
        let token = PreviewToken::generate();

        let manifest = engine.start_and_wait(&token, "http://cam/video.mjpg").await.unwrap();
        assert_eq!(manifest.url, format!("/hls/preview/{token}/index.m3u8"));
        assert!(manifest.path.starts_with(dir.path().join("hls")));

        engine.shutdown().await;
        assert!(!engine.is_running(&token).await);
    }
}
