//! MJPEG relay endpoint
//!
//! `GET /stream?url=<source uri>` responds with a `multipart/x-mixed-replace`
//! body a browser `<img>` tag can render directly. Each part carries one JPEG
//! frame; the response runs for the life of the connection, and closing it
//! (either side) is the sole termination signal.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::Deserialize;

use crate::relay::Viewer;

use super::AppState;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Source URI to relay
    pub url: String,
}

/// Attach a viewer and stream frames until either side disconnects
///
/// A failed spawn (decoder missing, source unreachable) is the caller's
/// problem: 502, no session left behind. Once streaming starts there is no
/// in-band error signal; failures close the connection.
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    match state.registry.attach(&query.url).await {
        Ok(viewer) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(frame_stream(viewer)),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            format!("stream unavailable: {}", e),
        )
            .into_response(),
    }
}

/// Turn a viewer into a multipart body stream
///
/// Ends when the session dies; dropping the stream (client disconnect) drops
/// the viewer, which detaches it from the session.
fn frame_stream(viewer: Viewer) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold(viewer, |mut viewer| async move {
        let frame = viewer.next_frame().await?;
        Some((Ok(encode_part(&frame)), viewer))
    })
}

/// Encode one frame as a multipart part
///
/// Layout: boundary line, content-type header, blank line, frame bytes,
/// trailing CRLF.
fn encode_part(frame: &Bytes) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.len() + 48);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}
