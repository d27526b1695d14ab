//! Shared video relay
//!
//! One decode process per distinct source URI, no matter how many viewers are
//! watching. The [`StreamRegistry`] owns the URI-to-session map; each
//! [`StreamSession`] pumps its decoder's MJPEG output through the demuxer and
//! broadcasts whole frames to every attached [`Viewer`] without copying the
//! image data.
//!
//! Lifecycle is strictly viewer-driven: the first attach for a URI spawns the
//! decoder, the last detach kills it immediately.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<StreamRegistry>
//!                  ┌──────────────────────────┐
//!                  │ slots: HashMap<Uri,      │
//!                  │   Slot {                 │
//!                  │     session, closed,     │
//!                  │   }                      │
//!                  │ >                        │
//!                  └────────────┬─────────────┘
//!                               │ attach / detach
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//!        [pump task]       [Viewer]         [Viewer]
//!        ffmpeg stdout     next_frame()     next_frame()
//!              │                ▲                ▲
//!              └── demux ──► broadcast ──────────┘
//! ```
//!
//! Frame delivery is zero-copy: the broadcast channel clones a `Bytes` handle
//! per viewer, never the JPEG data behind it.

mod config;
mod registry;
mod session;

pub use config::RelayConfig;
pub use registry::{StreamRegistry, Viewer};
pub use session::StreamSession;
