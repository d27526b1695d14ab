//! Decode subprocess management
//!
//! Each live source URI is served by exactly one external decode process
//! (ffmpeg), launched with a fixed set of transcode arguments that produce
//! MJPEG on stdout. The subprocess's stdout is the only byte stream consumed;
//! stderr is drained to the log and kept as a short tail for spawn diagnostics.
//!
//! [`SourceLauncher`] is the seam between the relay and the operating system:
//! production uses [`FfmpegLauncher`], tests substitute scripted byte sources.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Number of stderr lines retained for spawn-failure diagnostics
const STDERR_TAIL_LINES: usize = 8;

/// Decode process settings
///
/// These are operator configuration, not caller input: a viewer request only
/// ever supplies the source URI.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Decoder binary to invoke
    pub binary: String,

    /// Output frame rate
    pub frame_rate: u32,

    /// Output video bitrate (ffmpeg syntax, e.g. "800k")
    pub video_bitrate: String,

    /// Upstream connection timeout, passed to the decoder itself
    pub connect_timeout: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            frame_rate: 15,
            video_bitrate: "800k".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DecoderConfig {
    /// Set the decoder binary path
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Set the output frame rate
    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps;
        self
    }

    /// Set the output bitrate
    pub fn video_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.video_bitrate = bitrate.into();
        self
    }

    /// Set the upstream connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Decode process could not start or produced no output
#[derive(Debug, Clone, thiserror::Error)]
#[error("decode process failed to start: {reason}")]
pub struct SpawnError {
    /// Human-readable failure description (binary missing, source unreachable)
    pub reason: String,
}

impl SpawnError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Kill switch for a running source
///
/// Stop is immediate and unconditional; there is no graceful shutdown
/// negotiation with the decoder.
pub trait SourceGuard: Send {
    /// Terminate the underlying process
    fn stop(&mut self);
}

/// A launched source: its byte stream plus the handle that owns the process
pub struct SourceHandle {
    /// Bytes read during the readiness probe, to be demuxed first
    pub initial: Bytes,

    /// The decode process's stdout
    pub output: Box<dyn AsyncRead + Send + Unpin>,

    guard: Box<dyn SourceGuard>,
}

impl SourceHandle {
    /// Assemble a handle from its parts
    pub fn new(
        initial: Bytes,
        output: Box<dyn AsyncRead + Send + Unpin>,
        guard: Box<dyn SourceGuard>,
    ) -> Self {
        Self {
            initial,
            output,
            guard,
        }
    }

    /// Kill the underlying process
    pub fn stop(&mut self) {
        self.guard.stop();
    }

    /// Decompose into probe bytes, output stream and kill switch
    pub fn into_parts(self) -> (Bytes, Box<dyn AsyncRead + Send + Unpin>, Box<dyn SourceGuard>) {
        (self.initial, self.output, self.guard)
    }
}

/// Launches one decode process per source URI
#[async_trait]
pub trait SourceLauncher: Send + Sync {
    /// Spawn a decoder for `uri`
    ///
    /// Fails with [`SpawnError`] when the binary is unavailable or the source
    /// is unreachable (the decoder exits before producing any output).
    async fn launch(&self, uri: &str) -> Result<SourceHandle, SpawnError>;
}

/// Production launcher backed by an ffmpeg subprocess
pub struct FfmpegLauncher {
    config: DecoderConfig,
}

impl FfmpegLauncher {
    /// Create a launcher with the given decoder settings
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Render the fixed transcode argv for a source URI
    fn argv(&self, uri: &str) -> Vec<String> {
        vec![
            "-rtsp_transport".into(),
            "tcp".into(),
            "-stimeout".into(),
            self.config.connect_timeout.as_micros().to_string(),
            "-i".into(),
            uri.to_string(),
            "-an".into(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-r".into(),
            self.config.frame_rate.to_string(),
            "-b:v".into(),
            self.config.video_bitrate.clone(),
            "-loglevel".into(),
            "error".into(),
            "-".into(),
        ]
    }
}

#[async_trait]
impl SourceLauncher for FfmpegLauncher {
    async fn launch(&self, uri: &str) -> Result<SourceHandle, SpawnError> {
        let args = self.argv(uri);
        tracing::debug!(uri = %uri, binary = %self.config.binary, args = ?args, "Spawning decode process");

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::new(format!("{}: {}", self.config.binary, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::new("stdout not captured"))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let uri = uri.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(uri = %uri, "decoder: {}", line);
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // Readiness probe: the decoder either produces output or exits on its
        // own (its -stimeout flag bounds the upstream connection attempt). An
        // exit before any output means the source is unreachable.
        let probe_window = self.config.connect_timeout + Duration::from_secs(2);
        let mut probe = vec![0u8; 8192];

        let initial = match timeout(probe_window, stdout.read(&mut probe)).await {
            Ok(Ok(0)) => {
                let status = match timeout(Duration::from_secs(1), child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "unknown".to_string(),
                };
                let tail = stderr_tail
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(SpawnError::new(format!(
                    "decoder exited before producing output ({}): {}",
                    status, tail
                )));
            }
            Ok(Ok(n)) => Bytes::copy_from_slice(&probe[..n]),
            Ok(Err(e)) => return Err(SpawnError::new(format!("decoder output read: {}", e))),
            Err(_) => {
                let _ = child.start_kill();
                return Err(SpawnError::new(format!(
                    "no decoder output within {:?}",
                    probe_window
                )));
            }
        };

        tracing::info!(uri = %uri, first_bytes = initial.len(), "Decode process started");

        Ok(SourceHandle::new(
            initial,
            Box::new(stdout),
            Box::new(ChildGuard { child }),
        ))
    }
}

/// Owns the child process; stop is an unconditional kill
struct ChildGuard {
    child: Child,
}

impl SourceGuard for ChildGuard {
    fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Kill on already-dead decode process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_is_fixed_except_uri() {
        let launcher = FfmpegLauncher::new(
            DecoderConfig::default()
                .frame_rate(30)
                .video_bitrate("1200k")
                .connect_timeout(Duration::from_secs(5)),
        );

        let args = launcher.argv("rtsp://cam1/stream");

        assert!(args.contains(&"rtsp://cam1/stream".to_string()));
        assert!(args.contains(&"image2pipe".to_string()));
        assert!(args.contains(&"mjpeg".to_string()));
        assert!(args.contains(&"30".to_string()));
        assert!(args.contains(&"1200k".to_string()));
        // Connection timeout is passed to the decoder in microseconds
        assert!(args.contains(&"5000000".to_string()));
        assert_eq!(args.last(), Some(&"-".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let launcher =
            FfmpegLauncher::new(DecoderConfig::default().binary("/nonexistent/decoder-binary"));

        let result = launcher.launch("rtsp://cam1/stream").await;

        let err = result.err().expect("spawn should fail");
        assert!(err.reason.contains("/nonexistent/decoder-binary"));
    }
}
