use crate::artifacts::{MANIFEST_FILE, SEGMENT_PATTERN};
use crate::error::{Result, StreamError};
use std::path::Path;
use tokio::process::Command;

/// 上游摄像头地址的类型, 决定 FFmpeg 输入参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rtsp,
    /// 明确的 MJPEG 推流 (mjpg/mjpeg/video.cgi 等路径)
    Mjpeg,
    /// 其他 HTTP(S) 来源, 如快照或分块 JPEG
    Http,
}

impl SourceKind {
    pub fn classify(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(StreamError::InvalidSource("empty source url".into()));
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            Ok(SourceKind::Rtsp)
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            if lower.contains("mjpg") || lower.contains("mjpeg") || lower.contains("video.cgi") {
                Ok(SourceKind::Mjpeg)
            } else {
                Ok(SourceKind::Http)
            }
        } else {
            Err(StreamError::InvalidSource(trimmed.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HlsOptions {
    pub segment_seconds: u32,
    pub playlist_size: u32,
}

/// 生成 HLS 转码参数
///
/// 只保留视频并重新编码, 固定切片时长, 旧切片由 FFmpeg 自己删除。
/// 清单文件路径始终是最后一个参数。
pub fn hls_args(kind: SourceKind, source_url: &str, output_dir: &Path, opts: &HlsOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostats", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match kind {
        SourceKind::Rtsp => {
            args.extend(["-rtsp_transport", "tcp"].map(String::from));
        }
        SourceKind::Mjpeg => {
            args.extend(["-fflags", "nobuffer", "-flags", "low_delay", "-f", "mjpeg"].map(String::from));
        }
        SourceKind::Http => {
            args.extend(["-fflags", "nobuffer", "-flags", "low_delay"].map(String::from));
        }
    }

    args.push("-i".into());
    args.push(source_url.trim().to_string());

    args.extend(
        [
            "-an",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "hls",
        ]
        .map(String::from),
    );
    args.push("-hls_time".into());
    args.push(opts.segment_seconds.to_string());
    args.push("-hls_list_size".into());
    args.push(opts.playlist_size.to_string());
    // temp_file: 切片写完才改名, 目录里出现的 .ts 总是完整的
    args.push("-hls_flags".into());
    args.push("delete_segments+temp_file".into());
    args.push("-hls_segment_filename".into());
    args.push(output_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned());
    args.push(output_dir.join(MANIFEST_FILE).to_string_lossy().into_owned());

    args
}

pub fn command(binary: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(args);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HlsOptions {
        HlsOptions {
            segment_seconds: 2,
            playlist_size: 5,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn classify_source_urls() {
        assert_eq!(SourceKind::classify("rtsp://cam/feed").unwrap(), SourceKind::Rtsp);
        assert_eq!(SourceKind::classify("RTSPS://cam/feed").unwrap(), SourceKind::Rtsp);
        assert_eq!(
            SourceKind::classify("http://10.0.0.3/video.mjpg").unwrap(),
            SourceKind::Mjpeg
        );
        assert_eq!(
            SourceKind::classify("https://cam.local/snapshot.jpg").unwrap(),
            SourceKind::Http
        );
        assert!(matches!(
            SourceKind::classify("  "),
            Err(StreamError::InvalidSource(_))
        ));
        assert!(matches!(
            SourceKind::classify("file:///etc/passwd"),
            Err(StreamError::InvalidSource(_))
        ));
    }

    #[test]
    fn rtsp_uses_tcp_and_video_only_hls() {
        let dir = Path::new("/srv/hls/42");
        let args = hls_args(SourceKind::Rtsp, "rtsp://cam/feed", dir, &opts());

        assert!(has_pair(&args, "-rtsp_transport", "tcp"));
        assert!(has_pair(&args, "-i", "rtsp://cam/feed"));
        assert!(args.iter().any(|a| a == "-an"));
        assert!(has_pair(&args, "-hls_time", "2"));
        assert!(has_pair(&args, "-hls_list_size", "5"));
        assert!(has_pair(&args, "-hls_flags", "delete_segments+temp_file"));
        assert!(has_pair(&args, "-hls_segment_filename", "/srv/hls/42/segment_%03d.ts"));
        assert_eq!(args.last().map(String::as_str), Some("/srv/hls/42/index.m3u8"));
        assert!(!args.iter().any(|a| a == "nobuffer"));
    }

    #[test]
    fn http_sources_get_low_latency_flags() {
        let dir = Path::new("/srv/hls/7");
        let mjpeg = hls_args(SourceKind::Mjpeg, "http://cam/video.mjpg", dir, &opts());
        assert!(has_pair(&mjpeg, "-fflags", "nobuffer"));
        assert!(has_pair(&mjpeg, "-flags", "low_delay"));
        assert!(has_pair(&mjpeg, "-f", "mjpeg"));
        assert!(!mjpeg.iter().any(|a| a == "-rtsp_transport"));

        let http = hls_args(SourceKind::Http, "http://cam/stream", dir, &opts());
        assert!(has_pair(&http, "-fflags", "nobuffer"));
        assert!(!has_pair(&http, "-f", "mjpeg"));
    }
}
