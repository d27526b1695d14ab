//! Stream registry implementation
//!
//! Process-wide map from source URI to live session. The registry serializes
//! create/attach/detach per URI so that concurrent viewer requests for the same
//! camera can never spawn two decode processes, while requests for different
//! cameras proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::source::{SourceLauncher, SpawnError};

use super::config::RelayConfig;
use super::session::StreamSession;

/// Per-URI slot guarding session creation and teardown
///
/// A closed slot has been removed from the map; an attacher that raced the
/// teardown must fetch a fresh slot instead of reviving this one.
#[derive(Default)]
struct Slot {
    session: Option<Arc<StreamSession>>,
    closed: bool,
}

/// Central registry for all active stream sessions
///
/// Sessions are started lazily on first attach and stopped eagerly when the
/// subscriber count reaches zero. The registry is the only mutable shared
/// state in the video path; everything else belongs to a single session.
pub struct StreamRegistry {
    launcher: Box<dyn SourceLauncher>,
    config: RelayConfig,

    /// Map of source URI to its creation/teardown slot
    slots: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,

    /// Number of live sessions, for health reporting
    active: AtomicUsize,
}

impl StreamRegistry {
    /// Create a registry over the given launcher with default configuration
    pub fn new(launcher: Box<dyn SourceLauncher>) -> Self {
        Self::with_config(launcher, RelayConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(launcher: Box<dyn SourceLauncher>, config: RelayConfig) -> Self {
        Self {
            launcher,
            config,
            slots: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Attach a viewer to `uri`, starting a session if none exists
    ///
    /// Atomic with respect to concurrent attach calls for the same URI: the
    /// first caller spawns the decode process while the others wait on the
    /// slot, then join the session it created.
    pub async fn attach(self: &Arc<Self>, uri: &str) -> Result<Viewer, SpawnError> {
        loop {
            let slot_arc = self.slot_for(uri).await;
            let mut slot = slot_arc.lock().await;

            // Torn down while we waited on the lock; fetch a fresh slot
            if slot.closed {
                continue;
            }

            if let Some(session) = &slot.session {
                let rx = session.subscribe();
                tracing::info!(
                    uri = %uri,
                    subscribers = session.subscriber_count(),
                    "Viewer attached (existing stream)"
                );
                return Ok(Viewer::new(uri, rx, Arc::downgrade(self)));
            }

            // First subscriber: spawn the decode process while holding the
            // slot so same-URI attachers wait instead of double-spawning.
            let handle = match self.launcher.launch(uri).await {
                Ok(handle) => handle,
                Err(e) => {
                    slot.closed = true;
                    self.slots.write().await.remove(uri);
                    tracing::warn!(uri = %uri, error = %e, "Stream attach failed");
                    return Err(e);
                }
            };

            let session = StreamSession::start(uri, handle, &self.config, Arc::downgrade(self));
            let rx = session.subscribe();
            slot.session = Some(session);
            self.active.fetch_add(1, Ordering::SeqCst);

            tracing::info!(uri = %uri, "Viewer attached (new stream)");
            return Ok(Viewer::new(uri, rx, Arc::downgrade(self)));
        }
    }

    /// Detach one viewer from `uri`
    ///
    /// When the last viewer leaves, the session is stopped immediately and the
    /// decode process killed; there is no keep-warm period.
    pub async fn detach(&self, uri: &str) {
        let slot_arc = { self.slots.read().await.get(uri).cloned() };
        let Some(slot_arc) = slot_arc else { return };

        let mut slot = slot_arc.lock().await;
        let Some(session) = slot.session.as_ref() else {
            return;
        };

        let remaining = session.unsubscribe();
        tracing::debug!(uri = %uri, subscribers = remaining, "Viewer detached");

        if remaining == 0 {
            let session = slot.session.take();
            slot.closed = true;
            self.slots.write().await.remove(uri);
            self.active.fetch_sub(1, Ordering::SeqCst);
            drop(slot);

            if let Some(session) = session {
                session.stop();
            }
            tracing::info!(uri = %uri, "Last viewer left, session removed");
        }
    }

    /// Remove a session whose decode process terminated on its own
    ///
    /// Called by the session's pump task. Treated like an explicit stop: the
    /// session disappears and every subscriber's channel closes; a fresh
    /// attach is required to re-establish the stream. The map entry is removed
    /// before the pump is aborted so a self-cancelling pump cannot leave a
    /// dead session registered.
    pub(crate) async fn remove_crashed(&self, uri: &str, crashed: &Arc<StreamSession>) {
        let slot_arc = { self.slots.read().await.get(uri).cloned() };
        let Some(slot_arc) = slot_arc else { return };

        let mut slot = slot_arc.lock().await;
        let is_current = slot
            .session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, crashed));
        if !is_current {
            return;
        }

        let session = slot.session.take();
        slot.closed = true;
        self.slots.write().await.remove(uri);
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(slot);

        if let Some(session) = session {
            session.stop();
        }
        tracing::warn!(uri = %uri, "Decode process terminated unexpectedly, session removed");
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Get the slot for `uri`, creating it if absent
    async fn slot_for(&self, uri: &str) -> Arc<Mutex<Slot>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(uri) {
                return slot.clone();
            }
        }

        let mut slots = self.slots.write().await;
        slots
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }
}

/// A viewer's counted handle onto a stream session
///
/// Receives the session's frames in production order. Dropping the handle
/// detaches it; the session it references is kept alive by the union of its
/// viewers, not by any single one.
pub struct Viewer {
    uri: String,
    rx: broadcast::Receiver<Bytes>,
    registry: Weak<StreamRegistry>,
    detached: bool,
}

impl Viewer {
    fn new(uri: &str, rx: broadcast::Receiver<Bytes>, registry: Weak<StreamRegistry>) -> Self {
        Self {
            uri: uri.to_string(),
            rx,
            registry,
            detached: false,
        }
    }

    /// Source URI this viewer is attached to
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Receive the next frame
    ///
    /// Returns `None` once the session is gone (last viewer left elsewhere, or
    /// the decode process died). A viewer that falls behind skips the frames
    /// it missed rather than stalling the session.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(uri = %self.uri, skipped = skipped, "Slow viewer skipped frames");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Detach explicitly instead of relying on drop
    pub async fn close(mut self) {
        self.detached = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.uri).await;
        }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let uri = std::mem::take(&mut self.uri);
            // Drop cannot await; the detach runs as its own task
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { registry.detach(&uri).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use crate::source::{SourceGuard, SourceHandle};

    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(payload);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    struct FakeGuard {
        killed: Arc<AtomicBool>,
    }

    impl SourceGuard for FakeGuard {
        fn stop(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    /// Launcher producing in-memory byte pipes instead of subprocesses
    struct FakeLauncher {
        spawns: AtomicU32,
        fail: AtomicBool,
        writers: std::sync::Mutex<Vec<DuplexStream>>,
        kills: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawns: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                writers: std::sync::Mutex::new(Vec::new()),
                kills: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn spawn_count(&self) -> u32 {
            self.spawns.load(Ordering::SeqCst)
        }

        async fn write(&self, data: &[u8]) {
            let mut writers = {
                let mut guard = self.writers.lock().unwrap();
                std::mem::take(&mut *guard)
            };
            for w in &mut writers {
                w.write_all(data).await.unwrap();
                w.flush().await.unwrap();
            }
            self.writers.lock().unwrap().extend(writers);
        }

        fn drop_writers(&self) {
            self.writers.lock().unwrap().clear();
        }

        fn last_kill_flag(&self) -> Arc<AtomicBool> {
            self.kills.lock().unwrap().last().unwrap().clone()
        }
    }

    /// Wrapper so the registry and the test can share one launcher
    struct SharedLauncher(Arc<FakeLauncher>);

    #[async_trait::async_trait]
    impl SourceLauncher for SharedLauncher {
        async fn launch(&self, _uri: &str) -> Result<SourceHandle, SpawnError> {
            // Widen the race window for concurrent-attach tests
            tokio::time::sleep(Duration::from_millis(10)).await;

            if self.0.fail.load(Ordering::SeqCst) {
                return Err(SpawnError {
                    reason: "source unreachable".to_string(),
                });
            }

            self.0.spawns.fetch_add(1, Ordering::SeqCst);

            let (writer, reader) = duplex(64 * 1024);
            self.0.writers.lock().unwrap().push(writer);

            let killed = Arc::new(AtomicBool::new(false));
            self.0.kills.lock().unwrap().push(killed.clone());

            Ok(SourceHandle::new(
                Bytes::new(),
                Box::new(reader),
                Box::new(FakeGuard { killed }),
            ))
        }
    }

    fn registry_with(launcher: &Arc<FakeLauncher>) -> Arc<StreamRegistry> {
        Arc::new(StreamRegistry::with_config(
            Box::new(SharedLauncher(launcher.clone())),
            RelayConfig::default().broadcast_capacity(8),
        ))
    }

    #[tokio::test]
    async fn test_second_attach_reuses_session() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let mut a = registry.attach("rtsp://cam1").await.unwrap();
        let mut b = registry.attach("rtsp://cam1").await.unwrap();

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(registry.session_count(), 1);

        let frame1 = jpeg(&[0x01]);
        let frame2 = jpeg(&[0x02, 0x03]);
        launcher.write(&frame1).await;
        launcher.write(&frame2).await;

        // Both viewers see the identical frame sequence
        assert_eq!(&a.next_frame().await.unwrap()[..], &frame1[..]);
        assert_eq!(&a.next_frame().await.unwrap()[..], &frame2[..]);
        assert_eq!(&b.next_frame().await.unwrap()[..], &frame1[..]);
        assert_eq!(&b.next_frame().await.unwrap()[..], &frame2[..]);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_refcounted_teardown() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let a = registry.attach("rtsp://cam1").await.unwrap();
        let b = registry.attach("rtsp://cam1").await.unwrap();
        let killed = launcher.last_kill_flag();

        a.close().await;
        // One viewer remains: the process must stay up
        assert!(!killed.load(Ordering::SeqCst));
        assert_eq!(registry.session_count(), 1);

        b.close().await;
        // Last viewer left: stopped immediately, not kept warm
        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_attach_spawns_once() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let attaches = (0..8).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.attach("rtsp://cam1").await })
        });
        let viewers: Vec<Viewer> = futures::future::join_all(attaches)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(registry.session_count(), 1);

        for v in viewers {
            v.close().await;
        }
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_creates_no_session() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        launcher.fail.store(true, Ordering::SeqCst);
        let result = registry.attach("rtsp://cam1").await;
        assert!(result.is_err());
        assert_eq!(registry.session_count(), 0);

        // A later attach gets a clean retry
        launcher.fail.store(false, Ordering::SeqCst);
        let v = registry.attach("rtsp://cam1").await.unwrap();
        assert_eq!(registry.session_count(), 1);
        v.close().await;
    }

    #[tokio::test]
    async fn test_process_crash_tears_down_session() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let mut a = registry.attach("rtsp://cam1").await.unwrap();

        // Decoder dies on its own
        launcher.drop_writers();

        // The viewer's channel closes rather than hanging
        let next = tokio::time::timeout(Duration::from_secs(1), a.next_frame())
            .await
            .expect("viewer should observe teardown");
        assert!(next.is_none());
        assert_eq!(registry.session_count(), 0);

        // Re-attach establishes a brand new session
        let v = registry.attach("rtsp://cam1").await.unwrap();
        assert_eq!(launcher.spawn_count(), 2);
        v.close().await;
    }

    #[tokio::test]
    async fn test_dropped_viewer_detaches() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let v = registry.attach("rtsp://cam1").await.unwrap();
        let killed = launcher.last_kill_flag();
        drop(v);

        // Drop detaches via a spawned task; give it a moment
        for _ in 0..50 {
            if registry.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.session_count(), 0);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_distinct_uris_get_distinct_sessions() {
        let launcher = FakeLauncher::new();
        let registry = registry_with(&launcher);

        let a = registry.attach("rtsp://cam1").await.unwrap();
        let b = registry.attach("rtsp://cam2").await.unwrap();

        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(registry.session_count(), 2);

        a.close().await;
        assert_eq!(registry.session_count(), 1);
        b.close().await;
        assert_eq!(registry.session_count(), 0);
    }
}
