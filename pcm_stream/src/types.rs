use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Blocks are exactly 20 ms of audio.
pub const BLOCKS_PER_SECOND: u32 = 50;

/// Remote server address, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl StreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Sample rate and channel layout of one side of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl BlockFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples in one 20 ms block.
    pub fn samples_per_block(&self) -> usize {
        (self.sample_rate / BLOCKS_PER_SECOND) as usize * self.channels as usize
    }

    /// Payload size of one block on the wire.
    pub fn block_bytes(&self) -> usize {
        self.samples_per_block() * 2
    }

    /// Check that a block is non-empty and fits in a single frame.
    pub fn validate(&self) -> Result<(), BlockFormatError> {
        let bytes = self.block_bytes();
        if bytes == 0 {
            return Err(BlockFormatError::Empty {
                sample_rate: self.sample_rate,
                channels: self.channels,
            });
        }
        if bytes > pcm_protocol::MAX_PAYLOAD_LEN {
            return Err(BlockFormatError::TooLarge { bytes });
        }
        Ok(())
    }
}

impl fmt::Display for BlockFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz x{}", self.sample_rate, self.channels)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockFormatError {
    #[error("{sample_rate}Hz with {channels} channels yields an empty 20ms block")]
    Empty { sample_rate: u32, channels: u16 },

    #[error("20ms block of {bytes} bytes exceeds the frame payload limit")]
    TooLarge { bytes: usize },
}
