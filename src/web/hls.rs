use crate::artifacts::{self, MANIFEST_FILE};
use crate::engine::Engine;
use crate::session::{DeviceId, PreviewToken, SessionKey};
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

type HlsResult = Result<Response<Body>, (StatusCode, String)>;

pub async fn serve_hls_file(
    State(state): State<SharedState>,
    Path((space, key, file_name)): Path<(String, String, String)>,
) -> HlsResult {
    // 1. Validate the file name before touching the filesystem
    if !artifacts::is_safe_file_name(&file_name) {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }

    let public_base = state.config.server.public_base.as_str();

    // 2. Resolve the key space (device ids vs. ephemeral preview tokens)
    if space == DeviceId::SPACE {
        let id = key
            .parse::<u64>()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid device id".to_string()))?;
        serve_session_file(&state.devices, &DeviceId(id), &file_name, public_base).await
    } else if space == PreviewToken::SPACE {
        let token = PreviewToken::parse(&key)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid preview token".to_string()))?;
        serve_session_file(&state.previews, &token, &file_name, public_base).await
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown stream space".to_string()))
    }
}

async fn serve_session_file<K: SessionKey>(
    engine: &Engine<K>,
    key: &K,
    file_name: &str,
    public_base: &str,
) -> HlsResult {
    let file_path = engine.session_dir(key).join(file_name);

    if file_name == MANIFEST_FILE {
        // A manifest left behind by a dead session must not be served
        if !engine.is_running(key).await {
            return Err((StatusCode::NOT_FOUND, "Stream not running".to_string()));
        }

        let manifest = tokio::fs::read_to_string(&file_path)
            .await
            .map_err(|_| (StatusCode::NOT_FOUND, "Manifest not ready".to_string()))?;

        // Rewrite segment references so that clients fetch them through this service
        let segment_base = format!("{}/hls/{}/{}", public_base.trim_end_matches('/'), K::SPACE, key.dir_name());
        let body = artifacts::rewrite_manifest(&manifest, &segment_base);
        debug!(space = K::SPACE, %key, "serving manifest");

        return Response::builder()
            .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(Body::from(body))
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    // Only segments are exposed besides the manifest; the log may carry credentials
    if !artifacts::is_segment_name(file_name) {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }

    // Open the file for reading
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    // Create a stream from the file
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
