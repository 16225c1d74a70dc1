use super::{AudioDevice, DeviceError};
use crate::types::BlockFormat;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, error, info};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Update the output file header about once a second.
const FLUSH_EVERY_BLOCKS: u32 = 50;

/// Capture that falls this far behind real time starts over from "now".
const MAX_LAG: Duration = Duration::from_millis(200);

const BLOCK_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct WavDeviceConfig {
    /// 16-bit PCM file played as the capture source, looped forever
    pub input: PathBuf,
    /// Where received playback audio is written; discarded when `None`
    pub output: Option<PathBuf>,
    /// Format of the audio the server sends for playback
    pub output_format: BlockFormat,
    /// Release capture blocks at real-time pace instead of as fast as asked
    pub realtime: bool,
}

struct CaptureState {
    samples: Vec<i16>,
    position: usize,
    next_due: Option<Instant>,
}

struct PlaybackState {
    writer: WavWriter<BufWriter<File>>,
    unflushed_blocks: u32,
}

/// File-backed stand-in for the codec: reads a WAV as microphone input and
/// records downlink audio to another WAV.
pub struct WavDevice {
    input_format: BlockFormat,
    capture: Mutex<CaptureState>,
    playback: Mutex<Option<PlaybackState>>,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    realtime: bool,
}

impl WavDevice {
    pub fn open(config: WavDeviceConfig) -> Result<Self, DeviceError> {
        let mut reader = WavReader::open(&config.input)?;
        let spec = reader.spec();

        info!(
            "📊 Capture file {}: {}Hz, {} channels, {} bits",
            config.input.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );

        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(DeviceError::Config(format!(
                "Expected 16-bit integer PCM, got {} bits {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        if samples.is_empty() {
            return Err(DeviceError::Config(format!(
                "{} contains no samples",
                config.input.display()
            )));
        }

        let playback = match &config.output {
            Some(path) => {
                let out_spec = WavSpec {
                    channels: config.output_format.channels,
                    sample_rate: config.output_format.sample_rate,
                    bits_per_sample: 16,
                    sample_format: SampleFormat::Int,
                };
                info!(
                    "💾 Recording playback to {} ({})",
                    path.display(),
                    config.output_format
                );
                Some(PlaybackState {
                    writer: WavWriter::create(path, out_spec)?,
                    unflushed_blocks: 0,
                })
            }
            None => None,
        };

        Ok(Self {
            input_format: BlockFormat::new(spec.sample_rate, spec.channels),
            capture: Mutex::new(CaptureState {
                samples,
                position: 0,
                next_due: None,
            }),
            playback: Mutex::new(playback),
            input_enabled: AtomicBool::new(false),
            output_enabled: AtomicBool::new(false),
            realtime: config.realtime,
        })
    }
}

impl AudioDevice for WavDevice {
    fn input_sample_rate(&self) -> u32 {
        self.input_format.sample_rate
    }

    fn input_channels(&self) -> u16 {
        self.input_format.channels
    }

    fn is_input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::Acquire)
    }

    fn enable_input(&self, enable: bool) {
        debug!("🎤 WAV capture {}", if enable { "enabled" } else { "disabled" });
        self.input_enabled.store(enable, Ordering::Release);
    }

    fn produce_input_block(&self, block: &mut [i16]) -> bool {
        if !self.is_input_enabled() {
            return false;
        }

        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);

        if self.realtime {
            let now = Instant::now();
            let due = match capture.next_due {
                Some(due) if now < due => return false,
                Some(due) if now.duration_since(due) <= MAX_LAG => due,
                _ => now,
            };
            capture.next_due = Some(due + BLOCK_DURATION);
        }

        let CaptureState {
            samples, position, ..
        } = &mut *capture;
        for sample in block.iter_mut() {
            *sample = samples[*position];
            *position = (*position + 1) % samples.len();
        }
        true
    }

    fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Acquire)
    }

    fn enable_output(&self, enable: bool) {
        debug!("🔊 WAV playback {}", if enable { "enabled" } else { "disabled" });
        self.output_enabled.store(enable, Ordering::Release);
    }

    fn consume_output_block(&self, block: &[i16]) -> bool {
        if !self.is_output_enabled() {
            return false;
        }

        let mut playback = self.playback.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = playback.as_mut() else {
            return true;
        };

        for &sample in block {
            if let Err(e) = state.writer.write_sample(sample) {
                error!("Failed to record playback sample: {}", e);
                return false;
            }
        }

        state.unflushed_blocks += 1;
        if state.unflushed_blocks >= FLUSH_EVERY_BLOCKS {
            state.unflushed_blocks = 0;
            if let Err(e) = state.writer.flush() {
                error!("Failed to flush playback recording: {}", e);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, spec: WavSpec, samples: &[i16]) -> PathBuf {
        let path = dir.path().join("input.wav");
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn mono_24k() -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate: 24000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_capture_loops_over_file() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, mono_24k(), &[1, 2, 3]);

        let device = WavDevice::open(WavDeviceConfig {
            input,
            output: None,
            output_format: BlockFormat::new(24000, 1),
            realtime: false,
        })
        .unwrap();
        assert_eq!(device.input_format(), BlockFormat::new(24000, 1));

        let mut block = [0i16; 4];
        assert!(!device.produce_input_block(&mut block), "disabled capture");

        device.enable_input(true);
        assert!(device.produce_input_block(&mut block));
        assert_eq!(block, [1, 2, 3, 1]);
        assert!(device.produce_input_block(&mut block));
        assert_eq!(block, [2, 3, 1, 2]);
    }

    #[test]
    fn test_realtime_capture_paces_blocks() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, mono_24k(), &[7; 480]);

        let device = WavDevice::open(WavDeviceConfig {
            input,
            output: None,
            output_format: BlockFormat::new(24000, 1),
            realtime: true,
        })
        .unwrap();
        device.enable_input(true);

        let mut block = vec![0i16; 480];
        assert!(device.produce_input_block(&mut block));
        // Next block is not due for another 20ms
        assert!(!device.produce_input_block(&mut block));
        std::thread::sleep(Duration::from_millis(25));
        assert!(device.produce_input_block(&mut block));
    }

    #[test]
    fn test_playback_is_recorded() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, mono_24k(), &[0; 10]);
        let output = dir.path().join("output.wav");

        let device = WavDevice::open(WavDeviceConfig {
            input,
            output: Some(output.clone()),
            output_format: BlockFormat::new(16000, 1),
            realtime: false,
        })
        .unwrap();

        assert!(!device.consume_output_block(&[1, 2]), "disabled playback");
        device.enable_output(true);
        assert!(device.consume_output_block(&[10, -10, 20]));
        drop(device);

        let mut reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![10, -10, 20]);
    }

    #[test]
    fn test_rejects_float_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("float.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 24000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        let result = WavDevice::open(WavDeviceConfig {
            input: path,
            output: None,
            output_format: BlockFormat::new(24000, 1),
            realtime: false,
        });
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }
}
