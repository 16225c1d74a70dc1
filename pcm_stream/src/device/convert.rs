use super::DeviceError;
use crate::types::BlockFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Converts interleaved s16 audio between two formats.
///
/// Channels are mapped first (average down to mono, duplicate up from mono),
/// then a sinc resampler runs when the rates differ. Input that does not fill
/// a resampler chunk is held until the next call, so output trails input by
/// at most one chunk plus the filter delay.
pub(crate) struct FormatConverter {
    from: BlockFormat,
    to: BlockFormat,
    resampler: Option<SincFixedIn<f32>>,
    /// Mapped samples per output channel, waiting for a full chunk
    pending: Vec<Vec<f32>>,
}

impl FormatConverter {
    pub fn new(from: BlockFormat, to: BlockFormat) -> Result<Self, DeviceError> {
        for format in [from, to] {
            if format.sample_rate == 0 || format.channels == 0 {
                return Err(DeviceError::Config(format!(
                    "Cannot convert audio of format {}",
                    format
                )));
            }
        }

        let resampler = if from.sample_rate != to.sample_rate {
            let ratio = to.sample_rate as f64 / from.sample_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            // 10ms of source audio per chunk
            let chunk_size = (from.sample_rate as usize / 100).max(1);
            let resampler =
                SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, to.channels as usize)
                    .map_err(|e| {
                        DeviceError::Config(format!("Failed to create resampler: {}", e))
                    })?;
            Some(resampler)
        } else {
            None
        };

        log::debug!("Audio conversion {} -> {}", from, to);

        Ok(Self {
            from,
            to,
            resampler,
            pending: vec![Vec::new(); to.channels as usize],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    /// Convert `input` and append whatever output is ready to `output`.
    /// A trailing partial frame in `input` is ignored.
    pub fn process(&mut self, input: &[i16], output: &mut Vec<i16>) -> Result<(), DeviceError> {
        if self.is_passthrough() {
            output.extend_from_slice(input);
            return Ok(());
        }

        let to_channels = self.to.channels as usize;
        for frame in input.chunks_exact(self.from.channels as usize) {
            for (channel, pending) in self.pending.iter_mut().enumerate() {
                pending.push(map_channel(frame, channel, to_channels));
            }
        }

        let Self {
            resampler, pending, ..
        } = self;

        let Some(resampler) = resampler.as_mut() else {
            interleave(pending.as_slice(), output);
            pending.iter_mut().for_each(Vec::clear);
            return Ok(());
        };

        loop {
            let needed = resampler.input_frames_next();
            if pending[0].len() < needed {
                break;
            }

            let chunk: Vec<&[f32]> = pending.iter().map(|ch| &ch[..needed]).collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|e| DeviceError::Stream(format!("Resampling failed: {}", e)))?;
            interleave(resampled.as_slice(), output);

            for channel in pending.iter_mut() {
                channel.drain(..needed);
            }
        }
        Ok(())
    }

    /// Forget buffered audio, e.g. after capture was switched off.
    pub fn reset(&mut self) {
        self.pending.iter_mut().for_each(Vec::clear);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

fn map_channel(frame: &[i16], channel: usize, to_channels: usize) -> f32 {
    let sample = if frame.len() == to_channels {
        frame[channel] as f32
    } else if to_channels == 1 {
        frame.iter().map(|&s| s as f32).sum::<f32>() / frame.len() as f32
    } else {
        frame[channel % frame.len()] as f32
    };
    sample / 32768.0
}

fn interleave<C: AsRef<[f32]>>(channels: &[C], output: &mut Vec<i16>) {
    let frames = channels.first().map_or(0, |ch| ch.as_ref().len());
    output.reserve(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            let sample = channel.as_ref()[i] * 32768.0;
            output.push(sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(from: BlockFormat, to: BlockFormat, input: &[i16]) -> Vec<i16> {
        let mut converter = FormatConverter::new(from, to).unwrap();
        let mut output = Vec::new();
        converter.process(input, &mut output).unwrap();
        output
    }

    fn sine(sample_rate: u32, channels: u16, frames: usize) -> Vec<i16> {
        (0..frames)
            .flat_map(|i| {
                let t = i as f32 / sample_rate as f32;
                let s = (0.5 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * 32767.0) as i16;
                std::iter::repeat(s).take(channels as usize)
            })
            .collect()
    }

    fn rms(samples: &[i16]) -> f32 {
        let sum: f32 = samples.iter().map(|&s| (s as f32) * (s as f32)).sum();
        (sum / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_same_format_passes_through() {
        let format = BlockFormat::new(24000, 1);
        let input = [1, -2, 3, i16::MIN, i16::MAX];
        assert_eq!(convert(format, format, &input), input);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let output = convert(
            BlockFormat::new(24000, 1),
            BlockFormat::new(24000, 2),
            &[1000, -2000, i16::MAX],
        );
        assert_eq!(output, [1000, 1000, -2000, -2000, i16::MAX, i16::MAX]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let output = convert(
            BlockFormat::new(48000, 2),
            BlockFormat::new(48000, 1),
            // trailing half frame is ignored
            &[100, 300, -50, -150, 7],
        );
        assert_eq!(output, [200, -100]);
    }

    #[test]
    fn test_48k_stereo_capture_to_24k_mono() {
        let mut converter =
            FormatConverter::new(BlockFormat::new(48000, 2), BlockFormat::new(24000, 1)).unwrap();
        let input = sine(48000, 2, 48000);

        // Arrives in 20ms callbacks like a sound card delivers it
        let mut output = Vec::new();
        for chunk in input.chunks(1920) {
            converter.process(chunk, &mut output).unwrap();
        }

        assert!(
            (23900..=24100).contains(&output.len()),
            "got {} samples",
            output.len()
        );
        let expected = rms(&input);
        let actual = rms(&output[2000..22000]);
        assert!(
            (actual - expected).abs() < expected * 0.1,
            "rms {} vs {}",
            actual,
            expected
        );
    }

    #[test]
    fn test_24k_mono_block_to_48k_stereo_playback() {
        let mut converter =
            FormatConverter::new(BlockFormat::new(24000, 1), BlockFormat::new(48000, 2)).unwrap();

        let mut output = Vec::new();
        for _ in 0..50 {
            converter.process(&sine(24000, 1, 480), &mut output).unwrap();
        }

        // One second in, one second out: 48000 frames of two channels
        assert_eq!(output.len() % 2, 0);
        assert!(
            (95_000..=96_100).contains(&output.len()),
            "got {} samples",
            output.len()
        );
        assert!(output.chunks_exact(2).all(|frame| frame[0] == frame[1]));
    }

    #[test]
    fn test_reset_drops_partial_chunk() {
        let mut converter =
            FormatConverter::new(BlockFormat::new(48000, 1), BlockFormat::new(24000, 1)).unwrap();
        let mut output = Vec::new();

        converter.process(&[100; 300], &mut output).unwrap();
        assert!(output.is_empty());

        converter.reset();
        converter.process(&[100; 300], &mut output).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_rejects_empty_format() {
        let result = FormatConverter::new(BlockFormat::new(0, 1), BlockFormat::new(24000, 1));
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }
}
