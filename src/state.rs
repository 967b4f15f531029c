use crate::artifacts::HealthReport;
use crate::config::AppConfig;
use crate::detection::{
    DeviceDirectory, FfmpegFrameGrabber, GuidanceCache, HttpClassifier, NotificationLog, StaticDevices,
};
use crate::engine::{Engine, EngineSettings, ManifestRef};
use crate::error::{Result, StreamError};
use crate::scheduler::{DetectionPolicy, DetectionScheduler, WatchSet, WatchStatus};
use crate::session::{DeviceId, PreviewToken};
use std::sync::Arc;
use std::time::Duration;

/// 保留的最近通知条数
const NOTIFICATION_CAPACITY: usize = 256;

/// 全局应用上下文, 启动时构建一次并注入到 HTTP 层和调度器
pub struct AppState {
    pub config: AppConfig,
    /// 设备流会话
    pub devices: Arc<Engine<DeviceId>>,
    /// 临时预览会话
    pub previews: Arc<Engine<PreviewToken>>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub scheduler: Arc<DetectionScheduler>,
    pub notifications: Arc<NotificationLog>,
    pub guidance: Arc<GuidanceCache>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let settings = EngineSettings::from_server(&config.server);
        let devices = Arc::new(Engine::new(&config.server.hls_root, settings.clone()));
        let previews = Arc::new(Engine::new(&config.server.preview_root, settings));

        let directory: Arc<dyn DeviceDirectory> = Arc::new(StaticDevices::from_config(&config.devices));
        let notifications = Arc::new(NotificationLog::new(NOTIFICATION_CAPACITY));
        let guidance = Arc::new(GuidanceCache::new(config.detection.guidance.clone()));

        let capture_timeout = Duration::from_secs(config.detection.capture_timeout_secs);
        let scheduler = Arc::new(DetectionScheduler::new(
            WatchSet::new(config.detection.watch.iter().copied()),
            directory.clone(),
            Arc::new(HttpClassifier::new(&config.detection.classifier_url, capture_timeout)?),
            notifications.clone(),
            Arc::new(FfmpegFrameGrabber::new(&config.server.ffmpeg_binary)),
            guidance.clone(),
            devices.clone(),
            DetectionPolicy::from_config(&config.detection),
        ));

        Ok(Self {
            config,
            devices,
            previews,
            directory,
            scheduler,
            notifications,
            guidance,
        })
    }

    pub async fn start_stream(&self, device_id: u64, source_url: &str) -> Result<ManifestRef> {
        self.devices.start_and_wait(&DeviceId(device_id), source_url).await
    }

    pub async fn stop_stream(&self, device_id: u64) -> bool {
        self.devices.stop(&DeviceId(device_id)).await
    }

    pub async fn is_running(&self, device_id: u64) -> bool {
        self.devices.is_running(&DeviceId(device_id)).await
    }

    pub fn manifest_ref_for(&self, device_id: u64) -> ManifestRef {
        self.devices.manifest_ref(&DeviceId(device_id))
    }

    pub async fn health(&self, device_id: u64) -> HealthReport {
        self.devices.health(&DeviceId(device_id)).await
    }

    /// 为任意地址启动即席预览
    ///
    /// 令牌只用一次, 失败时随错误一并交还。清单超时的会话保留, 由调用方凭令牌停止;
    /// 其余失败立即清理, 不在注册表中留下死句柄。
    pub async fn start_preview(
        &self,
        source_url: &str,
    ) -> std::result::Result<(PreviewToken, ManifestRef), (PreviewToken, StreamError)> {
        let token = PreviewToken::generate();
        match self.previews.start_and_wait(&token, source_url).await {
            Ok(manifest) => Ok((token, manifest)),
            Err(e) => {
                if !matches!(e, StreamError::ManifestTimeout { .. }) {
                    self.previews.stop(&token).await;
                }
                Err((token, e))
            }
        }
    }

    pub fn enable_watch(&self, device_id: u64) -> bool {
        self.scheduler.watch().enable(device_id)
    }

    pub fn disable_watch(&self, device_id: u64) -> bool {
        self.scheduler.watch().disable(device_id)
    }

    pub fn is_watched(&self, device_id: u64) -> bool {
        self.scheduler.watch().is_watched(device_id)
    }

    pub fn watch_status(&self) -> WatchStatus {
        self.scheduler.status()
    }

    /// 退出前停止调度器并拆除全部转码进程
    pub async fn shutdown(&self) {
        self.scheduler.abort();
        self.devices.shutdown().await;
        self.previews.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boundary_reports_idle_device() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "server:\n  listen: \"127.0.0.1:0\"\n  hls_root: \"{}\"\n  preview_root: \"{}\"\ndetection:\n  watch: [3]\n",
            dir.path().join("hls").display(),
            dir.path().join("preview").display()
        );
        let state = AppState::new(AppConfig::from_yaml(&yaml).unwrap()).unwrap();

        assert!(!state.is_running(42).await);
        assert!(!state.stop_stream(42).await);
        assert_eq!(state.manifest_ref_for(42).url, "/hls/device/42/index.m3u8");
        assert_eq!(state.health(42).await.error.as_deref(), Some("stream not started"));

        assert!(state.is_watched(3));
        assert!(state.enable_watch(8));
        assert!(!state.enable_watch(8));
        assert!(state.disable_watch(3));

        let status = state.watch_status();
        assert_eq!(status.watched_ids, vec![8]);
        assert!(!status.scheduler_alive);
    }

    #[cfg(unix)]
    fn state_with(dir: &tempfile::TempDir, body: &str, manifest_wait_ms: u64) -> AppState {
        use crate::engine::tests::fake_transcoder;

        let binary = fake_transcoder(dir.path(), "fake-ffmpeg", body);
        let yaml = format!(
            "server:\n  listen: \"127.0.0.1:0\"\n  ffmpeg_binary: \"{}\"\n  hls_root: \"{}\"\n  preview_root: \"{}\"\n  manifest_wait_ms: {}\n  stop_grace_ms: 200\n  min_free_memory_kb: 0\n",
            binary,
            dir.path().join("hls").display(),
            dir.path().join("preview").display(),
            manifest_wait_ms
        );
        AppState::new(AppConfig::from_yaml(&yaml).unwrap()).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_previews_leave_no_sessions() {
        use crate::engine::tests::FAILING;

        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, FAILING, 5000);

        for _ in 0..5 {
            let (_, err) = state.start_preview("rtsp://cam/feed").await.unwrap_err();
            assert!(matches!(err, StreamError::ProcessExited { .. }));
        }
        assert!(state.previews.sessions().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_preview_can_be_stopped_by_token() {
        use crate::engine::tests::SILENT;

        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, SILENT, 300);

        let (token, err) = state.start_preview("rtsp://cam/feed").await.unwrap_err();
        assert!(matches!(err, StreamError::ManifestTimeout { .. }));
        assert!(state.previews.is_running(&token).await);

        assert!(state.previews.stop(&token).await);
        assert!(state.previews.sessions().await.is_empty());
    }
}
