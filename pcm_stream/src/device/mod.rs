//! Hardware audio capability consumed by the streamers.
//!
//! Both directions call into the same device concurrently, one thread each.
//! Implementations synchronize internally so capture and playback never
//! contend with each other.

mod convert;
mod imp_cpal;
mod imp_wav;

pub use imp_cpal::{CpalConfig, CpalDevice};
pub use imp_wav::{WavDevice, WavDeviceConfig};

use crate::types::BlockFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub trait AudioDevice: Send + Sync {
    fn input_sample_rate(&self) -> u32;

    fn input_channels(&self) -> u16;

    fn is_input_enabled(&self) -> bool;

    fn enable_input(&self, enable: bool);

    /// Fill `block` with the next interleaved capture samples.
    ///
    /// Returns `false` when a whole block is not available yet; the caller
    /// should wait and ask again.
    fn produce_input_block(&self, block: &mut [i16]) -> bool;

    fn is_output_enabled(&self) -> bool;

    fn enable_output(&self, enable: bool);

    /// Queue interleaved samples for playback. Returns `false` if the device
    /// could not take them.
    fn consume_output_block(&self, block: &[i16]) -> bool;

    fn input_format(&self) -> BlockFormat {
        BlockFormat::new(self.input_sample_rate(), self.input_channels())
    }
}
