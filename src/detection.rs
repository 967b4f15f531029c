//! 自动检测所依赖的外部协作方
//!
//! 设备目录、推理服务、通知、单帧抓取都通过 trait 注入, 调度器只面向这些接口。

use crate::config::{DeviceConfig, OperationalState};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 不属于任何病害的标签
const NEUTRAL_LABELS: &[&str] = &["unknown", "background", "none"];

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: u64,
    pub name: String,
    pub source_url: Option<String>,
    pub state: OperationalState,
    pub owner_id: u64,
}

impl From<&DeviceConfig> for Device {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            source_url: cfg.source_url.clone(),
            state: cfg.state,
            owner_id: cfg.owner_id,
        }
    }
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_device(&self, id: u64) -> anyhow::Result<Option<Device>>;
}

/// 配置文件中的静态设备表
pub struct StaticDevices {
    devices: RwLock<HashMap<u64, Device>>,
}

impl StaticDevices {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.id, d)).collect()),
        }
    }

    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        Self::new(devices.iter().map(Device::from))
    }
}

#[async_trait]
impl DeviceDirectory for StaticDevices {
    async fn get_device(&self, id: u64) -> anyhow::Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }
}

/// 推理服务返回的单个检测框
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, frame: &[u8]) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassifierResponse {
    List(Vec<Detection>),
    Wrapped { detections: Vec<Detection> },
    Single(Detection),
}

/// 通过 HTTP 调用外部推理服务
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build classifier http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, frame: &[u8]) -> anyhow::Result<Vec<Detection>> {
        let payload = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(frame),
            "format": "jpeg",
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("failed to send frame to classifier")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("classifier returned error {}: {}", status, body);
        }

        let detections = match response.json::<ClassifierResponse>().await? {
            ClassifierResponse::List(list) => list,
            ClassifierResponse::Wrapped { detections } => detections,
            ClassifierResponse::Single(one) => vec![one],
        };
        debug!(count = detections.len(), "classifier responded");
        Ok(detections)
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create_notification(&self, owner_id: u64, title: &str, body: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub owner_id: u64,
    pub title: String,
    pub body: String,
    pub created_at: u64,
}

/// 内存中的最近通知, 同时写入服务日志
pub struct NotificationLog {
    entries: Mutex<VecDeque<Notification>>,
    capacity: usize,
}

impl NotificationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// 最新的在前
    pub fn recent(&self) -> Vec<Notification> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for NotificationLog {
    async fn create_notification(&self, owner_id: u64, title: &str, body: &str) -> anyhow::Result<()> {
        info!(owner_id, title, "notification created");
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Notification {
            owner_id,
            title: title.to_string(),
            body: body.to_string(),
            created_at,
        });
        Ok(())
    }
}

/// 单帧抓取; `Ok(None)` 表示在时限内没有拿到画面
#[async_trait]
pub trait FrameGrabber: Send + Sync {
    async fn capture_single_frame(&self, source_url: &str, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>>;

    async fn frame_from_segment(&self, segment: &Path, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>>;
}

/// 用一次性 FFmpeg 进程取一帧 JPEG
pub struct FfmpegFrameGrabber {
    binary: String,
}

impl FfmpegFrameGrabber {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn grab(&self, input_args: Vec<String>, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .args(&input_args)
            .args(["-frames:v", "1", "-f", "image2pipe", "-c:v", "mjpeg", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "frame capture timed out");
                return Ok(None);
            }
        };

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(status = %output.status, stderr = %stderr.trim(), "frame capture produced no image");
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }
}

#[async_trait]
impl FrameGrabber for FfmpegFrameGrabber {
    async fn capture_single_frame(&self, source_url: &str, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let mut args = Vec::new();
        if source_url.to_ascii_lowercase().starts_with("rtsp") {
            args.extend(["-rtsp_transport", "tcp"].map(String::from));
        }
        args.push("-i".into());
        args.push(source_url.to_string());
        self.grab(args, timeout).await
    }

    async fn frame_from_segment(&self, segment: &Path, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let args = vec!["-i".to_string(), segment.to_string_lossy().into_owned()];
        self.grab(args, timeout).await
    }
}

/// 病害标签 -> 处理建议 的缓存
#[derive(Default)]
pub struct GuidanceCache {
    entries: RwLock<HashMap<String, String>>,
}

impl GuidanceCache {
    pub fn new(seed: HashMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(
                seed.into_iter()
                    .map(|(label, text)| (label.to_lowercase(), text))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, label: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&label.to_lowercase())
            .cloned()
    }

    pub fn set(&self, label: &str, text: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.to_lowercase(), text);
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Diseased,
    Unknown,
}

/// 本次扫描中出现最多的病害
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Finding {
    pub label: String,
    pub occurrences: usize,
    pub top_confidence: f32,
    pub total_detections: usize,
}

/// 按标签把检测结果归为 健康/病害/未知
///
/// 低于置信度阈值的检测忽略; 出现次数相同时取置信度更高者。
pub fn assess(detections: &[Detection], healthy_labels: &[String], min_confidence: f32) -> (Verdict, Option<Finding>) {
    let confident: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.confidence >= min_confidence)
        .collect();
    if confident.is_empty() {
        return (Verdict::Unknown, None);
    }

    let is_healthy = |label: &str| healthy_labels.iter().any(|h| h.eq_ignore_ascii_case(label));
    let is_neutral = |label: &str| NEUTRAL_LABELS.iter().any(|n| n.eq_ignore_ascii_case(label));

    let mut tally: HashMap<String, (usize, f32)> = HashMap::new();
    for detection in &confident {
        let label = detection.label.trim();
        if label.is_empty() || is_healthy(label) || is_neutral(label) {
            continue;
        }
        let entry = tally.entry(label.to_lowercase()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 = entry.1.max(detection.confidence);
    }

    let top = tally.into_iter().max_by(|a, b| {
        a.1 .0
            .cmp(&b.1 .0)
            .then(a.1 .1.total_cmp(&b.1 .1))
            .then(b.0.cmp(&a.0))
    });

    match top {
        Some((label, (occurrences, top_confidence))) => (
            Verdict::Diseased,
            Some(Finding {
                label,
                occurrences,
                top_confidence,
                total_detections: confident.len(),
            }),
        ),
        None if confident.iter().any(|d| is_healthy(d.label.trim())) => (Verdict::Healthy, None),
        None => (Verdict::Unknown, None),
    }
}

/// 组装发给设备所有者的通知
pub fn compose_notification(device: &Device, finding: &Finding, guidance: Option<&str>) -> (String, String) {
    let title = format!("Disease detected on {}", device.name);
    let mut body = format!(
        "Automatic scan of device {} ({}) found \"{}\" in {} of {} detections (confidence {:.0}%).",
        device.name,
        device.id,
        finding.label,
        finding.occurrences,
        finding.total_detections,
        finding.top_confidence * 100.0
    );
    if let Some(text) = guidance {
        body.push_str("\n\nGuidance: ");
        body.push_str(text);
    }
    (title, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.into(),
            confidence,
        }
    }

    fn healthy() -> Vec<String> {
        vec!["healthy".into()]
    }

    #[test]
    fn most_frequent_disease_wins() {
        let detections = [
            det("leaf_blight", 0.6),
            det("rust", 0.9),
            det("Leaf_Blight", 0.7),
            det("healthy", 0.95),
        ];
        let (verdict, finding) = assess(&detections, &healthy(), 0.25);
        assert_eq!(verdict, Verdict::Diseased);

        let finding = finding.unwrap();
        assert_eq!(finding.label, "leaf_blight");
        assert_eq!(finding.occurrences, 2);
        assert_eq!(finding.total_detections, 4);
        assert!((finding.top_confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn healthy_and_unknown_verdicts() {
        assert_eq!(assess(&[det("Healthy", 0.8)], &healthy(), 0.25), (Verdict::Healthy, None));
        assert_eq!(assess(&[], &healthy(), 0.25), (Verdict::Unknown, None));
        assert_eq!(assess(&[det("rust", 0.1)], &healthy(), 0.25), (Verdict::Unknown, None));
        assert_eq!(assess(&[det("unknown", 0.9)], &healthy(), 0.25), (Verdict::Unknown, None));
    }

    #[test]
    fn notification_includes_guidance() {
        let device = Device {
            id: 3,
            name: "greenhouse-c".into(),
            source_url: None,
            state: OperationalState::Active,
            owner_id: 11,
        };
        let finding = Finding {
            label: "rust".into(),
            occurrences: 1,
            top_confidence: 0.875,
            total_detections: 2,
        };

        let (title, body) = compose_notification(&device, &finding, Some("Apply fungicide"));
        assert_eq!(title, "Disease detected on greenhouse-c");
        assert!(body.contains("\"rust\" in 1 of 2 detections"));
        assert!(body.contains("Guidance: Apply fungicide"));

        let (_, body) = compose_notification(&device, &finding, None);
        assert!(!body.contains("Guidance"));
    }

    #[test]
    fn guidance_lookup_ignores_case() {
        let cache = GuidanceCache::new(HashMap::from([("Rust".to_string(), "Remove leaves".to_string())]));
        assert_eq!(cache.get("rust").as_deref(), Some("Remove leaves"));
        cache.set("blight", "Ventilate".into());
        assert_eq!(cache.get("BLIGHT").as_deref(), Some("Ventilate"));
        assert_eq!(cache.get("mildew"), None);
    }

    #[tokio::test]
    async fn notification_log_is_bounded() {
        let log = NotificationLog::new(2);
        for i in 0..3 {
            log.create_notification(1, &format!("t{i}"), "b").await.unwrap();
        }
        let titles: Vec<_> = log.recent().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["t2", "t1"]);
    }

    #[tokio::test]
    async fn static_devices_lookup() {
        let devices = StaticDevices::new([Device {
            id: 1,
            name: "a".into(),
            source_url: Some("rtsp://a".into()),
            state: OperationalState::Active,
            owner_id: 5,
        }]);
        assert!(devices.get_device(1).await.unwrap().is_some());
        assert!(devices.get_device(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_classifier_is_an_error() {
        let classifier = HttpClassifier::new("http://127.0.0.1:9/classify", Duration::from_secs(2)).unwrap();
        let err = classifier.classify(b"frame").await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to send frame to classifier"));
    }
}
