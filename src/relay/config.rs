//! Relay configuration

use crate::demux::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for stream sessions and fan-out
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Frames buffered per subscriber channel before a slow subscriber lags
    pub broadcast_capacity: usize,

    /// Cap on a partial frame accumulated from the decoder
    pub max_frame_size: usize,

    /// Read buffer size for decoder output
    pub read_chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 16,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk_size: 32 * 1024,
        }
    }
}

impl RelayConfig {
    /// Set the per-subscriber broadcast capacity
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Set the partial-frame cap
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the decoder read buffer size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.broadcast_capacity, 16);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.read_chunk_size, 32 * 1024);
    }

    #[test]
    fn test_builder_chaining() {
        let config = RelayConfig::default()
            .broadcast_capacity(4)
            .max_frame_size(1024)
            .read_chunk_size(512);

        assert_eq!(config.broadcast_capacity, 4);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.read_chunk_size, 512);
    }

    #[test]
    fn test_capacity_floor() {
        let config = RelayConfig::default().broadcast_capacity(0);

        assert_eq!(config.broadcast_capacity, 1);
    }
}
