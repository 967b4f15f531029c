mod artifacts;
mod config;
mod detection;
mod engine;
mod error;
mod registry;
mod scheduler;
mod session;
mod state;
mod transcoder;
mod web;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use clap::Parser;
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Camera HLS Link - 摄像头转 HLS 网关
/// 解析命令行参数，加载配置文件，启动HTTP服务及后台自动检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cam-hls-link.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统, 默认 info 级别, 可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    info!(
        "Camera HLS Link initialized. HLS Root: {}, Preview Root: {}",
        config.server.hls_root, config.server.preview_root
    );

    let state = Arc::new(AppState::new(config.clone())?);

    // 启动后台自动检测
    if config.detection.enabled {
        state
            .scheduler
            .spawn(Duration::from_secs(config.detection.interval_secs.max(1)));
    } else {
        warn!("auto-detection disabled by configuration");
    }

    // 注册HTTP路由
    let app = Router::new()
        .route("/sys/status", get(web::api::sys_status)) // 系统状态
        .route("/streams", get(web::api::list_streams)) // 会话列表
        .route("/streams/:device_id/start", post(web::api::start_stream)) // 启动设备流
        .route("/streams/:device_id/stop", post(web::api::stop_stream)) // 停止设备流
        .route("/streams/:device_id/status", get(web::api::stream_status))
        .route("/streams/:device_id/health", get(web::api::stream_health))
        .route("/preview", post(web::api::start_preview)) // 即席预览
        .route("/preview/:token", delete(web::api::stop_preview))
        .route("/detection/status", get(web::api::detection_status))
        .route("/detection/:device_id/enable", post(web::api::enable_detection))
        .route("/detection/:device_id/disable", post(web::api::disable_detection))
        .route("/detection/:device_id/scan", post(web::api::scan_device)) // 手动单次检测
        .route("/guidance/:label", put(web::api::put_guidance))
        .route("/notifications", get(web::api::list_notifications))
        .route(
            "/hls/:space/:key/:file_name",
            get(web::hls::serve_hls_file), // 获取HLS文件
        )
        .with_state(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前拆除所有转码进程
    state.shutdown().await;
    info!("Camera HLS Link stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
