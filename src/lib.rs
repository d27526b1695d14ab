//! Factory-floor monitoring relay
//!
//! Two real-time relay subsystems between slow upstream sources and many
//! concurrent browser clients:
//!
//! - **Video relay**: each RTSP camera is decoded by exactly one ffmpeg
//!   subprocess, its MJPEG output split into frames and fanned out zero-copy
//!   to every watching viewer. Sessions start on the first viewer and stop
//!   the moment the last one leaves.
//! - **Change relay**: a background watcher detects row-level mutations in
//!   the production database (tailing a notification channel, or polling a
//!   timestamp cursor) and broadcasts them to every connected dashboard
//!   WebSocket.
//!
//! ```text
//!  RTSP cam ─► ffmpeg ─► JpegDemuxer ─► StreamSession ─► broadcast ─► N viewers
//!                                           ▲
//!                            StreamRegistry attach/detach
//!
//!  Postgres ─► ChangeWatcher ─► EventBroadcaster ─► N dashboard sockets
//! ```
//!
//! The library exposes each subsystem for testing; the binary in `main.rs`
//! wires them behind an axum server.

pub mod config;
pub mod demux;
pub mod hub;
pub mod relay;
pub mod server;
pub mod source;
pub mod watch;

pub use config::AppConfig;
pub use hub::EventBroadcaster;
pub use relay::{RelayConfig, StreamRegistry, Viewer};
pub use source::{DecoderConfig, FfmpegLauncher, SourceLauncher, SpawnError};
pub use watch::{ChangeEvent, WatchConfig, WatchStrategy};
