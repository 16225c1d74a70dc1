use crate::connection::SessionBody;
use crate::device::AudioDevice;
use crate::error;
use log::debug;
use pcm_protocol::{le_bytes_to_samples, read_header, Direction, MAX_PAYLOAD_LEN};
use std::io::Read;
use std::sync::Arc;

/// Socket → validate → playback.
///
/// Payload and sample buffers are sized for the largest frame the header can
/// describe and reused across frames.
pub struct Downlink<D: AudioDevice + ?Sized> {
    device: Arc<D>,
    payload: Vec<u8>,
    samples: Vec<i16>,
    blocks_played: u64,
    blocks_dropped: u64,
}

impl<D: AudioDevice + ?Sized> Downlink<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            payload: vec![0; MAX_PAYLOAD_LEN],
            samples: vec![0; MAX_PAYLOAD_LEN / 2],
            blocks_played: 0,
            blocks_dropped: 0,
        }
    }

    pub fn blocks_played(&self) -> u64 {
        self.blocks_played
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped
    }
}

impl<S: Read, D: AudioDevice + ?Sized> SessionBody<S> for Downlink<D> {
    fn step(&mut self, stream: &mut S) -> error::Result<()> {
        let header = read_header(stream)?.expect_pcm(Direction::Downlink)?;

        // A frame cut short by EOF is a transport failure, never a short block
        let payload = &mut self.payload[..header.payload_len()];
        stream.read_exact(payload)?;
        let count = le_bytes_to_samples(payload, &mut self.samples);

        if !self.device.is_output_enabled() {
            self.device.enable_output(true);
        }
        if self.device.consume_output_block(&self.samples[..count]) {
            self.blocks_played += 1;
            if self.blocks_played % 500 == 0 {
                debug!("🔊 Downlink played {} blocks", self.blocks_played);
            }
        } else {
            self.blocks_dropped += 1;
            debug!(
                "⚠️  Playback refused a block of {} samples ({} dropped so far)",
                count, self.blocks_dropped
            );
        }
        Ok(())
    }
}
