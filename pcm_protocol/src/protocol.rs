use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// `PCM0` read as a little-endian u32.
pub const PCM_MAGIC: u32 = 0x304D_4350;

/// Size of the fixed frame header on the wire.
pub const HEADER_LEN: usize = 7;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Token sent by the device right after connecting its capture connection.
pub const UPLINK_HELLO: &[u8] = b"HELLO-UP";

/// Token sent by the device right after connecting its playback connection.
pub const DOWNLINK_HELLO: &[u8] = b"HELLO-DOWN";

/// Reasons a frame header is rejected.
///
/// None of these are fatal for the process; a connection that yields one is
/// simply torn down and re-established.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unknown direction tag {0}")]
    UnknownDirection(u8),

    #[error("zero-length payload")]
    EmptyPayload,

    #[error("expected {expected} frame, got {got}")]
    UnexpectedDirection { expected: Direction, got: Direction },

    #[error("payload length {0} is not a whole number of 16-bit samples")]
    OddPayloadLength(u16),

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    Invalid(#[from] InvalidFrame),
}

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Device capture → server
    Uplink = 0x01,
    /// Server → device playback
    Downlink = 0x02,
}

impl Direction {
    /// The handshake token announcing a connection for this direction.
    pub fn hello(self) -> &'static [u8] {
        match self {
            Direction::Uplink => UPLINK_HELLO,
            Direction::Downlink => DOWNLINK_HELLO,
        }
    }
}

impl TryFrom<u8> for Direction {
    type Error = InvalidFrame;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Direction::Uplink),
            0x02 => Ok(Direction::Downlink),
            _ => Err(InvalidFrame::UnknownDirection(value)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => f.write_str("uplink"),
            Direction::Downlink => f.write_str("downlink"),
        }
    }
}

/// Decoded fixed header: `[magic:u32 LE][direction:u8][payload_len:u16 LE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub direction: Direction,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn new(direction: Direction, payload_len: u16) -> Self {
        Self {
            direction,
            payload_len,
        }
    }

    /// Serialize the header. The magic is always written.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&PCM_MAGIC.to_le_bytes());
        bytes[4] = self.direction as u8;
        bytes[5..7].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    /// Parse exactly one header.
    ///
    /// The magic is checked first, so a buffer with the wrong magic is rejected
    /// whatever the remaining bytes hold.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, InvalidFrame> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != PCM_MAGIC {
            return Err(InvalidFrame::BadMagic(magic));
        }

        let direction = Direction::try_from(bytes[4])?;
        let payload_len = u16::from_le_bytes([bytes[5], bytes[6]]);
        if payload_len == 0 {
            return Err(InvalidFrame::EmptyPayload);
        }

        Ok(Self {
            direction,
            payload_len,
        })
    }

    /// Stricter check applied by a receiver bound to one direction: the tag
    /// must match and the payload must hold whole 16-bit samples.
    pub fn expect_pcm(self, expected: Direction) -> Result<Self, InvalidFrame> {
        if self.direction != expected {
            return Err(InvalidFrame::UnexpectedDirection {
                expected,
                got: self.direction,
            });
        }
        if self.payload_len % 2 != 0 {
            return Err(InvalidFrame::OddPayloadLength(self.payload_len));
        }
        Ok(self)
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }
}

/// Build header + payload as one contiguous buffer.
pub fn encode(direction: Direction, payload: &[u8]) -> Result<Vec<u8>, InvalidFrame> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(direction, payload, &mut frame)?;
    Ok(frame)
}

/// Same as [`encode`] but reuses `frame`'s allocation.
pub fn encode_into(
    direction: Direction,
    payload: &[u8],
    frame: &mut Vec<u8>,
) -> Result<(), InvalidFrame> {
    let header = FrameHeader::new(direction, checked_payload_len(payload.len())?);
    frame.clear();
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(())
}

/// Frame a block of samples, converting them to little-endian on the way.
pub fn encode_samples_into(
    direction: Direction,
    samples: &[i16],
    frame: &mut Vec<u8>,
) -> Result<(), InvalidFrame> {
    let header = FrameHeader::new(direction, checked_payload_len(samples.len() * 2)?);
    frame.clear();
    frame.reserve(HEADER_LEN + samples.len() * 2);
    frame.extend_from_slice(&header.to_bytes());
    for sample in samples {
        frame.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(())
}

/// Decode just the header part of a buffer.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<FrameHeader, InvalidFrame> {
    FrameHeader::from_bytes(bytes)
}

/// Block until one full header has been read and decode it.
pub fn read_header<R: Read>(reader: &mut R) -> Result<FrameHeader, ProtocolError> {
    let mut bytes = [0u8; HEADER_LEN];
    reader.read_exact(&mut bytes)?;
    let header = FrameHeader::from_bytes(&bytes)?;
    log::trace!(
        "📥 {} header, {} payload bytes",
        header.direction,
        header.payload_len
    );
    Ok(header)
}

/// Write one frame, retrying short writes until done or the transport fails.
pub fn write_frame<W: Write>(
    writer: &mut W,
    direction: Direction,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let header = FrameHeader::new(direction, checked_payload_len(payload.len())?);
    writer.write_all(&header.to_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    log::trace!("📤 {} frame, {} payload bytes", direction, payload.len());
    Ok(())
}

/// Convert little-endian PCM bytes into `samples`, returning how many were
/// written. A trailing odd byte is ignored.
pub fn le_bytes_to_samples(bytes: &[u8], samples: &mut [i16]) -> usize {
    let mut count = 0;
    for (pair, sample) in bytes.chunks_exact(2).zip(samples.iter_mut()) {
        *sample = i16::from_le_bytes([pair[0], pair[1]]);
        count += 1;
    }
    count
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn checked_payload_len(len: usize) -> Result<u16, InvalidFrame> {
    if len == 0 {
        return Err(InvalidFrame::EmptyPayload);
    }
    u16::try_from(len).map_err(|_| InvalidFrame::PayloadTooLarge(len))
}
