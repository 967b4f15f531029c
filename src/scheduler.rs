use crate::config::{DetectionConfig, OperationalState};
use crate::detection::{
    assess, compose_notification, Classifier, Device, DeviceDirectory, FrameGrabber, GuidanceCache,
    NotificationSink, Verdict,
};
use crate::engine::Engine;
use crate::session::DeviceId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// 隐式拉流后等待首个切片的轮询间隔
const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 参与定时扫描的设备集合
///
/// 只有成员关系, enable/disable 都是幂等的。与流注册表相互独立。
#[derive(Default)]
pub struct WatchSet {
    ids: Mutex<BTreeSet<u64>>,
}

impl WatchSet {
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// 返回成员关系是否发生变化
    pub fn enable(&self, id: u64) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).insert(id)
    }

    pub fn disable(&self, id: u64) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    pub fn is_watched(&self, id: u64) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DetectionPolicy {
    pub capture_timeout: Duration,
    pub implicit_stream: bool,
    pub stop_after_scan: bool,
    pub min_confidence: f32,
    pub healthy_labels: Vec<String>,
}

impl DetectionPolicy {
    pub fn from_config(cfg: &DetectionConfig) -> Self {
        Self {
            capture_timeout: Duration::from_secs(cfg.capture_timeout_secs),
            implicit_stream: cfg.implicit_stream,
            stop_after_scan: cfg.stop_after_scan,
            min_confidence: cfg.min_confidence,
            healthy_labels: cfg.healthy_labels.clone(),
        }
    }
}

/// 单次设备扫描的取帧与停流策略
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub implicit_stream: bool,
    pub stop_after: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    Segment,
    ImplicitStream,
    DirectCapture,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub device_id: u64,
    pub verdict: Verdict,
    pub label: Option<String>,
    pub confidence: Option<f32>,
    pub frame_source: FrameSource,
    pub notified: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeviceScan {
    Scanned(ScanResult),
    /// 设备存在但当前不参与扫描
    Skipped { device_id: u64, reason: String },
    /// 设备已不存在, 自动移出监测集合
    Disabled { device_id: u64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub results: Vec<DeviceScan>,
    pub failures: Vec<(u64, String)>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed(TickSummary),
    /// 上一轮仍在执行, 本轮跳过
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    pub scheduler_alive: bool,
    pub watched_ids: Vec<u64>,
    pub count: usize,
}

/// 自动检测调度器
///
/// 每轮快照监测集合, 逐个设备取帧、推理、在发现病害时通知设备所有者。
/// 单个设备的失败只记录日志, 不影响同一轮中的其他设备。
pub struct DetectionScheduler {
    watch: WatchSet,
    devices: Arc<dyn DeviceDirectory>,
    classifier: Arc<dyn Classifier>,
    notifications: Arc<dyn NotificationSink>,
    grabber: Arc<dyn FrameGrabber>,
    guidance: Arc<GuidanceCache>,
    streams: Arc<Engine<DeviceId>>,
    policy: DetectionPolicy,
    tick_guard: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    ticks: Mutex<TickTasks>,
}

/// 后台派生的扫描任务; 停止后新派生的任务立即取消
#[derive(Default)]
struct TickTasks {
    stopped: bool,
    handles: Vec<JoinHandle<()>>,
}

impl DetectionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watch: WatchSet,
        devices: Arc<dyn DeviceDirectory>,
        classifier: Arc<dyn Classifier>,
        notifications: Arc<dyn NotificationSink>,
        grabber: Arc<dyn FrameGrabber>,
        guidance: Arc<GuidanceCache>,
        streams: Arc<Engine<DeviceId>>,
        policy: DetectionPolicy,
    ) -> Self {
        Self {
            watch,
            devices,
            classifier,
            notifications,
            grabber,
            guidance,
            streams,
            policy,
            tick_guard: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
            ticks: Mutex::new(TickTasks::default()),
        }
    }

    pub fn watch(&self) -> &WatchSet {
        &self.watch
    }

    pub fn status(&self) -> WatchStatus {
        let watched_ids = self.watch.snapshot();
        WatchStatus {
            scheduler_alive: self.is_alive(),
            count: watched_ids.len(),
            watched_ids,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// 启动后台定时任务
    ///
    /// 每个周期派生一次扫描; 若上一轮尚未结束, 本轮被跳过而不是排队。
    pub fn spawn(self: &Arc<Self>, interval: Duration) {
        self.ticks.lock().unwrap_or_else(PoisonError::into_inner).stopped = false;

        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "detection scheduler started");

            loop {
                ticker.tick().await; // 等待指定的时间间隔
                let tick = {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        match scheduler.try_tick().await {
                            TickOutcome::Completed(summary) => {
                                info!(
                                    scanned = summary.results.len(),
                                    failed = summary.failures.len(),
                                    elapsed_ms = summary.elapsed_ms,
                                    "detection tick finished"
                                );
                            }
                            TickOutcome::Skipped => {
                                warn!("previous detection tick still running, skipping");
                            }
                        }
                    })
                };
                scheduler.track_tick(tick);
            }
        });

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn track_tick(&self, tick: JoinHandle<()>) {
        let mut ticks = self.ticks.lock().unwrap_or_else(PoisonError::into_inner);
        if ticks.stopped {
            tick.abort();
            return;
        }
        ticks.handles.retain(|handle| !handle.is_finished());
        ticks.handles.push(tick);
    }

    /// 停止定时任务, 同时取消仍在执行的扫描
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }

        let mut ticks = self.ticks.lock().unwrap_or_else(PoisonError::into_inner);
        ticks.stopped = true;
        for tick in ticks.handles.drain(..) {
            tick.abort();
        }
    }

    /// 执行一轮扫描; 已有一轮在执行时立即返回 `Skipped`
    pub async fn try_tick(&self) -> TickOutcome {
        let Ok(_running) = self.tick_guard.try_lock() else {
            return TickOutcome::Skipped;
        };

        let started = Instant::now();
        // --- 阶段 1: 快照监测集合, 之后不再持有其锁 ---
        let watched = self.watch.snapshot();
        let mut summary = TickSummary::default();

        let options = ScanOptions {
            implicit_stream: self.policy.implicit_stream,
            stop_after: self.policy.stop_after_scan,
        };

        // --- 阶段 2: 逐个设备扫描, 单个失败不影响其他设备 ---
        for id in watched {
            match self.scan_device(id, options).await {
                Ok(scan) => summary.results.push(scan),
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(device_id = id, error = %message, "device scan failed");
                    summary.failures.push((id, message));
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        TickOutcome::Completed(summary)
    }

    /// 手动单次检测: 必要时拉起流, 检测结束后停止该设备的流
    pub async fn scan_now(&self, id: u64) -> anyhow::Result<DeviceScan> {
        self.scan_device(
            id,
            ScanOptions {
                implicit_stream: true,
                stop_after: true,
            },
        )
        .await
    }

    pub async fn scan_device(&self, id: u64, options: ScanOptions) -> anyhow::Result<DeviceScan> {
        let lookup = match self.devices.get_device(id).await {
            Ok(lookup) => lookup,
            Err(e) => {
                self.watch.disable(id);
                return Err(e.context("device lookup failed, auto-detection disabled"));
            }
        };
        let Some(device) = lookup else {
            if self.watch.disable(id) {
                warn!(device_id = id, "device no longer exists, disabling auto-detection");
            }
            return Ok(DeviceScan::Disabled { device_id: id });
        };

        if device.state != OperationalState::Active {
            debug!(device_id = id, state = ?device.state, "device not active, skipping");
            return Ok(DeviceScan::Skipped {
                device_id: id,
                reason: "device not active".into(),
            });
        }
        let Some(source_url) = device.source_url.clone().filter(|url| !url.trim().is_empty()) else {
            return Ok(DeviceScan::Skipped {
                device_id: id,
                reason: "no source url".into(),
            });
        };

        let result = self.scan_frame(&device, &source_url, options).await;

        if options.stop_after && self.streams.stop(&DeviceId(id)).await {
            debug!(device_id = id, "stream stopped after scan");
        }

        result.map(DeviceScan::Scanned)
    }

    async fn scan_frame(&self, device: &Device, source_url: &str, options: ScanOptions) -> anyhow::Result<ScanResult> {
        let (frame, frame_source) = self.acquire_frame(device.id, source_url, options).await?;

        // 推理失败按本轮未检出处理
        let detections = match self.classifier.classify(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                warn!(device_id = device.id, error = %e, "classifier failed, treating as no detection");
                Vec::new()
            }
        };

        let (verdict, finding) = assess(&detections, &self.policy.healthy_labels, self.policy.min_confidence);

        let mut notified = false;
        if let Some(finding) = &finding {
            let guidance = self.guidance.get(&finding.label);
            let (title, body) = compose_notification(device, finding, guidance.as_deref());
            self.notifications
                .create_notification(device.owner_id, &title, &body)
                .await?;
            notified = true;
            info!(
                device_id = device.id,
                label = %finding.label,
                owner_id = device.owner_id,
                "disease detected"
            );
        }

        Ok(ScanResult {
            device_id: device.id,
            verdict,
            label: finding.as_ref().map(|f| f.label.clone()),
            confidence: finding.as_ref().map(|f| f.top_confidence),
            frame_source,
            notified,
        })
    }

    /// 优先使用已有会话的最新切片, 否则 (按策略) 隐式拉流, 最后直接抓取单帧
    async fn acquire_frame(&self, id: u64, source_url: &str, options: ScanOptions) -> anyhow::Result<(Vec<u8>, FrameSource)> {
        let key = DeviceId(id);
        let timeout = self.policy.capture_timeout;

        if self.streams.is_running(&key).await {
            if let Some(segment) = self.streams.latest_segment(&key).await {
                if let Some(frame) = self.frame_from_segment(id, &segment, timeout).await {
                    return Ok((frame, FrameSource::Segment));
                }
            }
        } else if options.implicit_stream {
            match self.streams.start(&key, source_url).await {
                Ok(_) => {
                    if let Some(segment) = self.wait_for_segment(&key, timeout).await {
                        if let Some(frame) = self.frame_from_segment(id, &segment, timeout).await {
                            return Ok((frame, FrameSource::ImplicitStream));
                        }
                    }
                }
                Err(e) => warn!(device_id = id, error = %e, "implicit stream start failed"),
            }
        }

        match self.grabber.capture_single_frame(source_url, timeout).await? {
            Some(frame) => Ok((frame, FrameSource::DirectCapture)),
            None => anyhow::bail!("no frame captured from {}", source_url),
        }
    }

    async fn frame_from_segment(&self, id: u64, segment: &std::path::Path, timeout: Duration) -> Option<Vec<u8>> {
        match self.grabber.frame_from_segment(segment, timeout).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device_id = id, error = %e, "failed to decode frame from segment");
                None
            }
        }
    }

    async fn wait_for_segment(&self, key: &DeviceId, timeout: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(segment) = self.streams.latest_segment(key).await {
                return Some(segment);
            }
            if Instant::now() >= deadline || !self.streams.is_running(key).await {
                return None;
            }
            tokio::time::sleep(SEGMENT_POLL_INTERVAL).await;
        }
    }
}
