//! Per-client worker threads (spec §4.8–§4.11): receive, send, video render,
//! audio render, plus the lifecycle manager that spawns and tears them down.

pub mod audio_render;
pub mod lifecycle;
pub mod receive;
pub mod send;
pub mod video_render;
