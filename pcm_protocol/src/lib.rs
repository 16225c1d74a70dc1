//! # PCM Protocol
//!
//! Framing for the device audio link.
//!
//! Every connection starts with a direction token (`HELLO-UP` or
//! `HELLO-DOWN`) and then carries nothing but frames:
//!
//! ```text
//! +-------------+-----------+-----------------+-----------------------+
//! | magic "PCM0"| direction | payload_len     | payload               |
//! | u32 LE      | u8 (1, 2) | u16 LE, nonzero | s16le PCM, interleaved|
//! +-------------+-----------+-----------------+-----------------------+
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use pcm_protocol::{decode_header, encode, Direction, HEADER_LEN};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let frame = encode(Direction::Uplink, &[0x10, 0x00, 0x20, 0x00])?;
//!
//! let header = decode_header(frame[..HEADER_LEN].try_into()?)?;
//! assert_eq!(header.direction, Direction::Uplink);
//! assert_eq!(header.payload_len(), 4);
//! # Ok(())
//! # }
//! ```

pub mod protocol;

// Re-export commonly used types
pub use protocol::{
    decode_header, encode, encode_into, encode_samples_into, le_bytes_to_samples, read_header,
    samples_to_le_bytes, write_frame, Direction, FrameHeader, InvalidFrame, ProtocolError,
    DOWNLINK_HELLO, HEADER_LEN, MAX_PAYLOAD_LEN, PCM_MAGIC, UPLINK_HELLO,
};
