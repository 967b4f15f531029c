pub mod api;
pub mod hls;
