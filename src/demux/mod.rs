//! JPEG frame demultiplexing
//!
//! The decode subprocess emits back-to-back JPEG images on its stdout with no
//! framing of its own. [`JpegDemuxer`] scans that byte stream incrementally and
//! yields one `Bytes` per complete image, bounded by the SOI (`FF D8`) and EOI
//! (`FF D9`) markers.
//!
//! The demuxer is fed arbitrary chunks with no alignment guarantee: a marker may
//! be split across two chunks, and a single chunk may contain zero or many
//! complete frames. Undelivered partial bytes are retained and prefixed to the
//! next chunk. Garbage before the first SOI (decoder preamble noise) is
//! discarded.
//!
//! A compressed payload can in theory contain a false `FF D9`; well-formed MJPEG
//! output escapes marker bytes in entropy-coded data, so the first EOI found is
//! treated as the true terminator. Correctness beyond that is best effort.

use bytes::{Bytes, BytesMut};

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Default cap on an in-progress frame before it is abandoned.
///
/// A source that emits an SOI but never an EOI would otherwise grow the buffer
/// without bound. 8 MiB is far above any plausible single MJPEG frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Incremental splitter for a stream of concatenated JPEG images.
pub struct JpegDemuxer {
    /// Accumulated bytes not yet emitted as a frame
    buf: BytesMut,

    /// Whether `buf` currently starts with an SOI marker
    in_frame: bool,

    /// Offset from which the EOI search resumes (avoids rescanning payload)
    scan_pos: usize,

    /// Maximum size of a partial frame before it is dropped
    max_frame_size: usize,

    /// Number of oversized partial frames abandoned so far
    dropped: u64,
}

impl JpegDemuxer {
    /// Create a demuxer with the default partial-frame cap
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a demuxer with a custom partial-frame cap
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            in_frame: false,
            scan_pos: 0,
            max_frame_size,
            dropped: 0,
        }
    }

    /// Feed a chunk of decoder output, returning any frames it completed
    ///
    /// Frames are returned in stream order. Returns an empty vec when the chunk
    /// did not complete a frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find_marker(&self.buf, 0, SOI) {
                    Some(at) => {
                        if at > 0 {
                            // Preamble or inter-frame noise
                            let _ = self.buf.split_to(at);
                        }
                        self.in_frame = true;
                        self.scan_pos = 2;
                    }
                    None => {
                        // Retain a trailing 0xFF: it may be half an SOI whose
                        // second byte arrives in the next chunk.
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let _ = self.buf.split_to(self.buf.len() - keep);
                        break;
                    }
                }
            }

            match find_marker(&self.buf, self.scan_pos, EOI) {
                Some(at) => {
                    frames.push(self.buf.split_to(at + 2).freeze());
                    self.in_frame = false;
                    self.scan_pos = 0;
                }
                None => {
                    if self.buf.len() > self.max_frame_size {
                        self.dropped += 1;
                        tracing::warn!(
                            buffered = self.buf.len(),
                            cap = self.max_frame_size,
                            dropped_total = self.dropped,
                            "Partial frame exceeded cap, dropping"
                        );
                        self.buf.clear();
                        self.in_frame = false;
                        self.scan_pos = 0;
                    } else {
                        // Resume one byte back so a marker split across chunks
                        // is still found.
                        self.scan_pos = self.buf.len().saturating_sub(1).max(2);
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Bytes currently buffered awaiting a frame boundary
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Number of oversized partial frames abandoned so far
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

impl Default for JpegDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a two-byte marker in `buf` at or after `from`
fn find_marker(buf: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    if buf.len() < 2 || from + 2 > buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(payload);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    fn feed_all(demuxer: &mut JpegDemuxer, data: &[u8], chunk_size: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        for chunk in data.chunks(chunk_size) {
            out.extend(demuxer.feed(chunk));
        }
        out
    }

    #[test]
    fn test_single_frame_single_chunk() {
        let frame = jpeg(&[0x01, 0x02, 0x03]);
        let mut demuxer = JpegDemuxer::new();

        let frames = demuxer.feed(&frame);

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
        assert_eq!(demuxer.buffered(), 0);
    }

    #[test]
    fn test_chunking_is_equivalent_to_one_shot() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"decoder preamble noise");
        stream.extend_from_slice(&jpeg(&[0x11; 40]));
        stream.extend_from_slice(&jpeg(&[0xFF, 0x00, 0xFF, 0x01, 0x7F]));
        stream.extend_from_slice(&jpeg(&[0x22; 9]));

        let mut reference = JpegDemuxer::new();
        let expected = reference.feed(&stream);
        assert_eq!(expected.len(), 3);

        for chunk_size in [1, 2, 3, 7, 16, 64] {
            let mut demuxer = JpegDemuxer::new();
            let frames = feed_all(&mut demuxer, &stream, chunk_size);
            assert_eq!(frames, expected, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn test_preamble_is_discarded() {
        let mut demuxer = JpegDemuxer::new();

        assert!(demuxer.feed(b"ffmpeg version banner junk").is_empty());
        // Nothing useful is retained while hunting for SOI
        assert!(demuxer.buffered() <= 1);

        let frame = jpeg(&[0xAB]);
        let frames = demuxer.feed(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn test_soi_split_across_chunks() {
        let mut demuxer = JpegDemuxer::new();

        assert!(demuxer.feed(&[0x00, 0x00, 0xFF]).is_empty());
        let frames = demuxer.feed(&[0xD8, 0x05, 0xFF, 0xD9]);

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x05, 0xFF, 0xD9]);
    }

    #[test]
    fn test_eoi_split_across_chunks() {
        let mut demuxer = JpegDemuxer::new();

        assert!(demuxer.feed(&[0xFF, 0xD8, 0x01, 0xFF]).is_empty());
        let frames = demuxer.feed(&[0xD9]);

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
    }

    #[test]
    fn test_oversized_partial_frame_is_dropped() {
        let mut demuxer = JpegDemuxer::with_max_frame_size(64);

        // SOI, then payload well past the cap, never an EOI
        assert!(demuxer.feed(&[0xFF, 0xD8]).is_empty());
        assert!(demuxer.feed(&[0x00; 128]).is_empty());

        assert_eq!(demuxer.dropped_frames(), 1);
        assert_eq!(demuxer.buffered(), 0);

        // Scanning resumes cleanly on subsequent bytes
        let frame = jpeg(&[0x42; 8]);
        let frames = demuxer.feed(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn test_back_to_back_frames_in_one_chunk() {
        let a = jpeg(&[0x01]);
        let b = jpeg(&[0x02, 0x03]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut demuxer = JpegDemuxer::new();
        let frames = demuxer.feed(&stream);

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut demuxer = JpegDemuxer::new();
        assert!(demuxer.feed(&[]).is_empty());
    }
}
