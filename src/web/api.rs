use crate::error::StreamError;
use crate::session::{DeviceId, PreviewToken};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

/// 接口错误, 统一返回 JSON
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            body: json!({ "error": message, "reason": message, "log_tail": "" }),
        }
    }
}

impl ApiError {
    /// 在错误体中附加一个字段
    fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(body) = self.body.as_object_mut() {
            body.insert(name.to_string(), value.into());
        }
        self
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        Self {
            status: e.status_code(),
            body: json!({
                "error": "stream start failed",
                "reason": e.reason(),
                "log_tail": e.log_tail(),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

#[derive(Debug, Deserialize, Default)]
pub struct StartRequest {
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub source_url: String,
}

/// 系统状态 API: 内存、负载, 以及转码启动的内存门槛是否满足
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let (total_kb, avail_kb) = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let min_free_kb = state.config.server.min_free_memory_kb;

    Json(json!({
        "mem_total_mb": total_kb / 1024,
        "mem_avail_mb": avail_kb / 1024,
        "load_avg": load,
        "can_spawn": min_free_kb == 0 || avail_kb >= min_free_kb,
        "device_sessions": state.devices.sessions().await.len(),
        "preview_sessions": state.previews.sessions().await.len(),
        "scheduler_alive": state.watch_status().scheduler_alive,
    }))
}

/// 获取会话列表 API, 设备会话与预览会话一起返回
pub async fn list_streams(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mut sessions = state.devices.sessions().await;
    sessions.extend(state.previews.sessions().await);

    Json(json!({ "count": sessions.len(), "streams": sessions }))
}

/// 启动设备流 API
/// 请求体未给出地址时使用设备记录中的地址; 等待清单生成后返回其地址
pub async fn start_stream(
    State(state): State<SharedState>,
    Path(device_id): Path<u64>,
    body: Option<Json<StartRequest>>,
) -> ApiResult {
    let requested = body.and_then(|Json(req)| req.source_url);
    let source_url = match requested {
        Some(url) => url,
        None => state
            .directory
            .get_device(device_id)
            .await
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .and_then(|device| device.source_url)
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "no source url for device"))?,
    };

    let manifest = state.start_stream(device_id, &source_url).await.map_err(|e| {
        error!(device_id, error = %e, "failed to start stream");
        ApiError::from(e)
    })?;

    Ok(Json(json!({
        "device_id": device_id,
        "manifest_url": manifest.url,
        "running": true,
    })))
}

/// 停止设备流 API, 未运行时 stopped 为 false
pub async fn stop_stream(State(state): State<SharedState>, Path(device_id): Path<u64>) -> Json<serde_json::Value> {
    let stopped = state.stop_stream(device_id).await;
    Json(json!({ "device_id": device_id, "stopped": stopped }))
}

pub async fn stream_status(State(state): State<SharedState>, Path(device_id): Path<u64>) -> Json<serde_json::Value> {
    let running = state.is_running(device_id).await;
    let manifest = state.manifest_ref_for(device_id);
    Json(json!({
        "device_id": device_id,
        "running": running,
        "manifest_url": running.then_some(manifest.url),
        "pid": state.devices.pid(&DeviceId(device_id)).await,
    }))
}

pub async fn stream_health(State(state): State<SharedState>, Path(device_id): Path<u64>) -> Json<serde_json::Value> {
    let report = state.health(device_id).await;
    Json(json!(report))
}

/// 即席预览: 为任意地址创建临时会话
/// 失败时错误体带上令牌, 清单超时的会话仍可凭令牌停止
pub async fn start_preview(State(state): State<SharedState>, Json(req): Json<PreviewRequest>) -> ApiResult {
    let (token, manifest) = state.start_preview(&req.source_url).await.map_err(|(token, e)| {
        error!(%token, error = %e, "failed to start preview");
        ApiError::from(e).with_field("token", token.as_str())
    })?;

    info!(%token, source = %req.source_url, "preview started");
    Ok(Json(json!({ "token": token.as_str(), "manifest_url": manifest.url })))
}

pub async fn stop_preview(State(state): State<SharedState>, Path(token): Path<String>) -> ApiResult {
    let token = PreviewToken::parse(&token).ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid token"))?;
    let stopped = state.previews.stop(&token).await;
    Ok(Json(json!({ "token": token.as_str(), "stopped": stopped })))
}

pub async fn enable_detection(State(state): State<SharedState>, Path(device_id): Path<u64>) -> Json<serde_json::Value> {
    let changed = state.enable_watch(device_id);
    Json(json!({ "device_id": device_id, "watched": state.is_watched(device_id), "changed": changed }))
}

pub async fn disable_detection(State(state): State<SharedState>, Path(device_id): Path<u64>) -> Json<serde_json::Value> {
    let changed = state.disable_watch(device_id);
    Json(json!({ "device_id": device_id, "watched": state.is_watched(device_id), "changed": changed }))
}

pub async fn detection_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!(state.watch_status()))
}

/// 手动单次检测, 结束后停止该设备的流
pub async fn scan_device(State(state): State<SharedState>, Path(device_id): Path<u64>) -> ApiResult {
    let scan = state.scheduler.scan_now(device_id).await.map_err(|e| {
        error!(device_id, error = %format!("{e:#}"), "on-demand scan failed");
        ApiError::new(StatusCode::BAD_GATEWAY, format!("{e:#}"))
    })?;
    Ok(Json(json!(scan)))
}

pub async fn put_guidance(
    State(state): State<SharedState>,
    Path(label): Path<String>,
    text: String,
) -> ApiResult {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty guidance text"));
    }
    state.guidance.set(&label, text);
    Ok(Json(json!({ "label": label, "stored": true })))
}

pub async fn list_notifications(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "notifications": state.notifications.recent() }))
}
