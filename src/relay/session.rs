//! Per-source stream session
//!
//! A [`StreamSession`] binds one decode process to its current subscriber set.
//! The session owns the process exclusively; subscribers collectively keep the
//! session alive through an explicit counted handle, and the last one out
//! triggers an immediate stop. Fan-out rides on `tokio::sync::broadcast`: the
//! inner `Bytes` of each frame is reference-counted, so delivery to N
//! subscribers never copies the image data.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::demux::JpegDemuxer;
use crate::source::{SourceGuard, SourceHandle};

use super::config::RelayConfig;
use super::registry::StreamRegistry;

/// Live binding between one source URI and its subscribers
pub struct StreamSession {
    uri: String,

    /// Broadcast sender for frame fan-out
    tx: broadcast::Sender<Bytes>,

    /// Number of attached subscribers
    subscribers: AtomicU32,

    /// Kill switch for the decode process, taken exactly once on stop
    guard: Mutex<Option<Box<dyn SourceGuard>>>,

    /// Pump task handle, aborted on stop
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Start a session for `uri` over a freshly launched source
    ///
    /// Spawns the pump task that reads decoder output, demuxes it into frames
    /// and broadcasts them. The registry reference is used to tear the session
    /// down if the decode process terminates on its own.
    pub(super) fn start(
        uri: &str,
        handle: SourceHandle,
        config: &RelayConfig,
        registry: Weak<StreamRegistry>,
    ) -> Arc<Self> {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);

        let (initial, output, guard) = handle.into_parts();

        let session = Arc::new(Self {
            uri: uri.to_string(),
            tx: tx.clone(),
            subscribers: AtomicU32::new(0),
            guard: Mutex::new(Some(guard)),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_frames(
            initial,
            output,
            tx,
            config.max_frame_size,
            config.read_chunk_size,
            registry,
            Arc::downgrade(&session),
            uri.to_string(),
        ));

        if let Ok(mut slot) = session.pump.lock() {
            *slot = Some(pump);
        }

        session
    }

    /// Source URI this session serves
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Add a subscriber, returning its frame receiver
    pub(super) fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        self.tx.subscribe()
    }

    /// Remove a subscriber, returning how many remain
    pub(super) fn unsubscribe(&self) -> u32 {
        let prev = self.subscribers.fetch_sub(1, Ordering::SeqCst);
        prev.saturating_sub(1)
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> u32 {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Stop the session: abort the pump and kill the decode process
    ///
    /// Idempotent. Subscribers drain any already-broadcast frames and then see
    /// their channel close once the session is dropped.
    pub(super) fn stop(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        if let Ok(mut guard) = self.guard.lock() {
            if let Some(mut guard) = guard.take() {
                guard.stop();
                tracing::info!(uri = %self.uri, "Decode process stopped");
            }
        }
    }
}

/// Read decoder output, demux into frames and broadcast them
///
/// Ends when the decoder closes its output (crash or kill). An end-of-stream
/// reached while the session is still registered is an unexpected termination
/// and tears the whole session down; subscribers must re-attach to recover.
#[allow(clippy::too_many_arguments)]
async fn pump_frames(
    initial: Bytes,
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    tx: broadcast::Sender<Bytes>,
    max_frame_size: usize,
    read_chunk_size: usize,
    registry: Weak<StreamRegistry>,
    session: Weak<StreamSession>,
    uri: String,
) {
    let mut demuxer = JpegDemuxer::with_max_frame_size(max_frame_size);
    let mut frames_sent: u64 = 0;

    for frame in demuxer.feed(&initial) {
        frames_sent += 1;
        let _ = tx.send(frame);
    }

    let mut buf = vec![0u8; read_chunk_size];
    loop {
        match output.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(uri = %uri, frames = frames_sent, "Decoder output ended");
                break;
            }
            Ok(n) => {
                for frame in demuxer.feed(&buf[..n]) {
                    frames_sent += 1;
                    // send only fails with zero receivers; frames before the
                    // first subscriber or after the last are simply dropped
                    let _ = tx.send(frame);
                }
            }
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "Decoder output read failed");
                break;
            }
        }
    }

    if let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) {
        registry.remove_crashed(&uri, &session).await;
    }
}
