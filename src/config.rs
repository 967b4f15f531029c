use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    /// 设备目录 (CRUD 后台之外的静态设备表)
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// 改写后切片地址的前缀, 为空时使用相对路径
    #[serde(default)]
    pub public_base: String,

    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,

    /// 设备会话的 HLS 切片存储根目录
    /// 建议配置为 /dev/shm/cam-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 临时预览会话的根目录, 与设备会话互不重叠
    #[serde(default = "default_preview_root")]
    pub preview_root: String,

    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// 等待 index.m3u8 生成的最长时间
    #[serde(default = "default_manifest_wait_ms")]
    pub manifest_wait_ms: u64,

    /// 优雅退出的等待时间, 超时后强制结束进程
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// 最新切片超过该时长即视为卡死
    #[serde(default = "default_stale_segment_secs")]
    pub stale_segment_secs: u64,

    /// 可用内存低于该值 (KB) 时拒绝启动新的转码进程, 0 表示不检查
    #[serde(default = "default_min_free_memory_kb")]
    pub min_free_memory_kb: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    /// 没有运行中的流时, 是否先隐式拉起流再取帧
    #[serde(default)]
    pub implicit_stream: bool,

    /// 定时扫描结束后是否停止该设备的流
    #[serde(default)]
    pub stop_after_scan: bool,

    #[serde(default = "default_classifier_url")]
    pub classifier_url: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_healthy_labels")]
    pub healthy_labels: Vec<String>,

    /// 启动时即加入监测集合的设备
    #[serde(default)]
    pub watch: Vec<u64>,

    /// 病害标签 -> 处理建议
    #[serde(default)]
    pub guidance: HashMap<String, String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            capture_timeout_secs: default_capture_timeout_secs(),
            implicit_stream: false,
            stop_after_scan: false,
            classifier_url: default_classifier_url(),
            min_confidence: default_min_confidence(),
            healthy_labels: default_healthy_labels(),
            watch: Vec::new(),
            guidance: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub state: OperationalState,
    pub owner_id: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_hls_root() -> String {
    "./static/hls".to_string()
}

fn default_preview_root() -> String {
    "./static/hls-preview".to_string()
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    5
}

fn default_manifest_wait_ms() -> u64 {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

fn default_stale_segment_secs() -> u64 {
    10
}

fn default_min_free_memory_kb() -> u64 {
    5120
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_capture_timeout_secs() -> u64 {
    10
}

fn default_classifier_url() -> String {
    "http://127.0.0.1:9000/classify".to_string()
}

fn default_min_confidence() -> f32 {
    0.25
}

fn default_healthy_labels() -> Vec<String> {
    vec!["healthy".to_string()]
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = AppConfig::from_yaml("server:\n  listen: \"127.0.0.1:8080\"\n").unwrap();

        assert_eq!(config.server.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.server.segment_seconds, 2);
        assert_eq!(config.server.stale_segment_secs, 10);
        assert_eq!(config.detection.interval_secs, 30);
        assert!(!config.detection.stop_after_scan);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn devices_and_guidance_are_parsed() {
        let yaml = r#"
server:
  listen: "0.0.0.0:8080"
  hls_root: "/dev/shm/cam-hls"
detection:
  interval_secs: 5
  watch: [1]
  guidance:
    leaf_blight: "Remove infected leaves"
devices:
  - id: 1
    name: greenhouse-a
    source_url: "rtsp://10.0.0.5/feed"
    owner_id: 7
  - id: 2
    name: greenhouse-b
    state: maintenance
    owner_id: 7
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.hls_root, "/dev/shm/cam-hls");
        assert_eq!(config.detection.watch, vec![1]);
        assert_eq!(
            config.detection.guidance.get("leaf_blight").map(String::as_str),
            Some("Remove infected leaves")
        );
        assert_eq!(config.devices[0].state, OperationalState::Active);
        assert_eq!(config.devices[1].state, OperationalState::Maintenance);
        assert!(config.devices[1].source_url.is_none());
    }
}
