use super::convert::FormatConverter;
use super::{AudioDevice, DeviceError};
use crate::types::BlockFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, SampleFormat, SizedSample, Stream, StreamConfig};
use crossbeam::channel;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

#[derive(Debug, Clone)]
pub struct CpalConfig {
    /// Input device name; the host default when `None`
    pub input_device: Option<String>,
    /// Output device name; the host default when `None`
    pub output_device: Option<String>,
    /// Format exchanged with the bridge. Capture is converted to it and
    /// playback is converted from it.
    pub stream_format: BlockFormat,
    /// How much audio each direction may queue before dropping the oldest
    pub queue_ms: u32,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            stream_format: BlockFormat::new(24000, 1),
            queue_ms: 1000,
        }
    }
}

/// Bounded FIFO of interleaved samples. Overflow drops whole frames.
struct SampleQueue {
    samples: Mutex<VecDeque<i16>>,
    capacity: usize,
    frame_len: usize,
}

impl SampleQueue {
    fn new(format: BlockFormat, queue_ms: u32) -> Self {
        let frame_len = format.channels.max(1) as usize;
        let frames = (format.sample_rate as usize * queue_ms as usize / 1000).max(1);
        Self::with_capacity(frames * frame_len, frame_len)
    }

    fn with_capacity(capacity: usize, frame_len: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            frame_len,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<i16>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples, dropping the oldest ones beyond capacity.
    fn push<I: IntoIterator<Item = i16>>(&self, samples: I) -> usize {
        let mut queue = self.lock();
        queue.extend(samples);
        let overflow = queue
            .len()
            .saturating_sub(self.capacity)
            .div_ceil(self.frame_len)
            .saturating_mul(self.frame_len)
            .min(queue.len());
        if overflow > 0 {
            queue.drain(..overflow);
        }
        overflow
    }

    /// Move exactly `block.len()` samples out, or nothing.
    fn pop_block(&self, block: &mut [i16]) -> bool {
        let mut queue = self.lock();
        if queue.len() < block.len() {
            return false;
        }
        let len = block.len();
        for (slot, sample) in block.iter_mut().zip(queue.drain(..len)) {
            *slot = sample;
        }
        true
    }

    /// Move everything queued onto the end of `out`.
    fn drain_into(&self, out: &mut Vec<i16>) {
        out.extend(self.lock().drain(..));
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

struct Formats {
    input: BlockFormat,
    output: BlockFormat,
}

/// One direction's converter plus scratch buffers reused across blocks.
struct Conversion {
    converter: FormatConverter,
    input: Vec<i16>,
    output: Vec<i16>,
}

impl Conversion {
    fn new(from: BlockFormat, to: BlockFormat) -> Result<Self, DeviceError> {
        Ok(Self {
            converter: FormatConverter::new(from, to)?,
            input: Vec::new(),
            output: Vec::new(),
        })
    }

    fn reset(&mut self) {
        self.converter.reset();
        self.input.clear();
        self.output.clear();
    }
}

/// The host sound card.
///
/// cpal streams are not `Send`, so they live on a dedicated audio thread for
/// the lifetime of the device. Callbacks only touch the shared queues, which
/// hold audio in the device's own formats. Conversion to and from the stream
/// format happens on the streamer threads.
pub struct CpalDevice {
    formats: Formats,
    stream_format: BlockFormat,
    capture: Arc<SampleQueue>,
    playback: Arc<SampleQueue>,
    /// Capture already in the stream format, waiting to fill a block
    captured: SampleQueue,
    capture_conversion: Mutex<Conversion>,
    playback_conversion: Mutex<Conversion>,
    input_enabled: Arc<AtomicBool>,
    output_enabled: Arc<AtomicBool>,
    stop_tx: channel::Sender<()>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalDevice {
    pub fn open(config: CpalConfig) -> Result<Self, DeviceError> {
        let stream_format = config.stream_format;
        let queue_ms = config.queue_ms;
        stream_format
            .validate()
            .map_err(|e| DeviceError::Config(format!("Unusable stream format: {}", e)))?;

        let input_enabled = Arc::new(AtomicBool::new(false));
        let output_enabled = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = channel::bounded::<Result<Opened, DeviceError>>(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let thread_input_enabled = Arc::clone(&input_enabled);
        let thread_output_enabled = Arc::clone(&output_enabled);

        let audio_thread = thread::Builder::new()
            .name("pcm-audio".to_string())
            .spawn(move || {
                match start_streams(&config, thread_input_enabled, thread_output_enabled) {
                    Ok((opened, streams)) => {
                        let _ = ready_tx.send(Ok(opened));
                        // Keep the streams alive until the device is dropped
                        let _ = stop_rx.recv();
                        drop(streams);
                        log::debug!("CPAL: Audio thread exiting");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| DeviceError::Stream(format!("Failed to spawn audio thread: {}", e)))?;

        let opened = ready_rx
            .recv()
            .map_err(|_| DeviceError::Stream("Audio thread exited during setup".to_string()))??;

        let capture_conversion = Conversion::new(opened.formats.input, stream_format)?;
        let playback_conversion = Conversion::new(stream_format, opened.formats.output)?;
        log::info!(
            "🎛️  CPAL: streaming {} (capture converted from {}, playback converted to {})",
            stream_format,
            opened.formats.input,
            opened.formats.output
        );

        Ok(Self {
            formats: opened.formats,
            stream_format,
            capture: opened.capture,
            playback: opened.playback,
            captured: SampleQueue::new(stream_format, queue_ms),
            capture_conversion: Mutex::new(capture_conversion),
            playback_conversion: Mutex::new(playback_conversion),
            input_enabled,
            output_enabled,
            stop_tx,
            audio_thread: Some(audio_thread),
        })
    }

    /// Format the capture stream runs at on the sound card.
    pub fn capture_format(&self) -> BlockFormat {
        self.formats.input
    }

    /// Format the output stream runs at on the sound card.
    pub fn output_format(&self) -> BlockFormat {
        self.formats.output
    }
}

fn lock_conversion(conversion: &Mutex<Conversion>) -> std::sync::MutexGuard<'_, Conversion> {
    conversion.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}

impl AudioDevice for CpalDevice {
    fn input_sample_rate(&self) -> u32 {
        self.stream_format.sample_rate
    }

    fn input_channels(&self) -> u16 {
        self.stream_format.channels
    }

    fn is_input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::Acquire)
    }

    fn enable_input(&self, enable: bool) {
        if !enable {
            self.capture.clear();
            self.captured.clear();
            lock_conversion(&self.capture_conversion).reset();
        }
        self.input_enabled.store(enable, Ordering::Release);
        log::info!("🎤 Capture {}", if enable { "enabled" } else { "disabled" });
    }

    fn produce_input_block(&self, block: &mut [i16]) -> bool {
        if !self.is_input_enabled() {
            return false;
        }

        let mut conversion = lock_conversion(&self.capture_conversion);
        let Conversion {
            converter,
            input,
            output,
        } = &mut *conversion;
        input.clear();
        output.clear();
        self.capture.drain_into(input);
        if let Err(e) = converter.process(input, output) {
            log::error!("❌ CPAL: Capture conversion failed: {}", e);
            return false;
        }
        let dropped = self.captured.push(output.drain(..));
        if dropped > 0 {
            log::trace!("CPAL: Converted capture overrun, dropped {} samples", dropped);
        }

        self.captured.pop_block(block)
    }

    fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Acquire)
    }

    fn enable_output(&self, enable: bool) {
        if !enable {
            self.playback.clear();
            lock_conversion(&self.playback_conversion).reset();
        }
        self.output_enabled.store(enable, Ordering::Release);
        log::info!("🔊 Playback {}", if enable { "enabled" } else { "disabled" });
    }

    fn consume_output_block(&self, block: &[i16]) -> bool {
        if !self.is_output_enabled() {
            return false;
        }
        let mut conversion = lock_conversion(&self.playback_conversion);
        let Conversion {
            converter, output, ..
        } = &mut *conversion;
        output.clear();
        if let Err(e) = converter.process(block, output) {
            log::error!("❌ CPAL: Playback conversion failed: {}", e);
            return false;
        }
        let dropped = self.playback.push(output.drain(..));
        if dropped > 0 {
            log::debug!("CPAL: Playback queue full, dropped {} samples", dropped);
        }
        true
    }
}

/// What the audio thread hands back once both streams are running.
struct Opened {
    formats: Formats,
    capture: Arc<SampleQueue>,
    playback: Arc<SampleQueue>,
}

/// Runs on the audio thread: open both devices, size the queues from their
/// formats, and start the streams.
fn start_streams(
    config: &CpalConfig,
    input_enabled: Arc<AtomicBool>,
    output_enabled: Arc<AtomicBool>,
) -> Result<(Opened, (Stream, Stream)), DeviceError> {
    let host = cpal::default_host();
    log::debug!("CPAL: Using audio host: {:?}", host.id());

    let input = find_device(&host, config.input_device.as_deref(), true)?;
    let output = find_device(&host, config.output_device.as_deref(), false)?;
    let input_config = input
        .default_input_config()
        .map_err(|e| DeviceError::Device(format!("No usable input config: {}", e)))?;
    let output_config = output
        .default_output_config()
        .map_err(|e| DeviceError::Device(format!("No usable output config: {}", e)))?;

    let formats = Formats {
        input: BlockFormat::new(input_config.sample_rate().0, input_config.channels()),
        output: BlockFormat::new(output_config.sample_rate().0, output_config.channels()),
    };
    log::info!(
        "🎛️  CPAL: capture {} {:?}, playback {} {:?}",
        formats.input,
        input_config.sample_format(),
        formats.output,
        output_config.sample_format()
    );

    let capture = Arc::new(SampleQueue::new(formats.input, config.queue_ms));
    let playback = Arc::new(SampleQueue::new(formats.output, config.queue_ms));

    let input_stream = build_input_stream(
        &input,
        input_config.sample_format(),
        &input_config.config(),
        Arc::clone(&capture),
        input_enabled,
    )?;
    let output_stream = build_output_stream(
        &output,
        output_config.sample_format(),
        &output_config.config(),
        Arc::clone(&playback),
        output_enabled,
    )?;
    for stream in [&input_stream, &output_stream] {
        stream
            .play()
            .map_err(|e| DeviceError::Stream(format!("Failed to start stream: {}", e)))?;
    }

    Ok((
        Opened {
            formats,
            capture,
            playback,
        },
        (input_stream, output_stream),
    ))
}

fn find_device(host: &Host, name: Option<&str>, input: bool) -> Result<Device, DeviceError> {
    let kind = if input { "input" } else { "output" };

    let Some(name) = name else {
        let default = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return default
            .ok_or_else(|| DeviceError::Device(format!("No default {} device available", kind)));
    };

    let enumerate_err =
        |e: cpal::DevicesError| DeviceError::Device(format!("Failed to enumerate devices: {}", e));
    let mut devices: Box<dyn Iterator<Item = Device>> = if input {
        Box::new(host.input_devices().map_err(enumerate_err)?)
    } else {
        Box::new(host.output_devices().map_err(enumerate_err)?)
    };

    devices
        .find(|dev| dev.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| DeviceError::Device(format!("{} device '{}' not found", kind, name)))
}

fn build_input_stream(
    device: &Device,
    format: SampleFormat,
    config: &StreamConfig,
    queue: Arc<SampleQueue>,
    enabled: Arc<AtomicBool>,
) -> Result<Stream, DeviceError> {
    match format {
        SampleFormat::I16 => input_stream::<i16>(device, config, queue, enabled),
        SampleFormat::F32 => input_stream::<f32>(device, config, queue, enabled),
        SampleFormat::U16 => input_stream::<u16>(device, config, queue, enabled),
        other => Err(DeviceError::Config(format!(
            "Unsupported input format: {:?}",
            other
        ))),
    }
}

fn build_output_stream(
    device: &Device,
    format: SampleFormat,
    config: &StreamConfig,
    queue: Arc<SampleQueue>,
    enabled: Arc<AtomicBool>,
) -> Result<Stream, DeviceError> {
    match format {
        SampleFormat::I16 => output_stream::<i16>(device, config, queue, enabled),
        SampleFormat::F32 => output_stream::<f32>(device, config, queue, enabled),
        SampleFormat::U16 => output_stream::<u16>(device, config, queue, enabled),
        other => Err(DeviceError::Config(format!(
            "Unsupported output format: {:?}",
            other
        ))),
    }
}

fn input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<SampleQueue>,
    enabled: Arc<AtomicBool>,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Acquire) {
                    return;
                }
                let dropped = queue.push(data.iter().map(|&s| s.to_sample::<i16>()));
                if dropped > 0 {
                    log::trace!("CPAL: Capture queue overrun, dropped {} samples", dropped);
                }
            },
            |err| log::error!("CPAL input stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Stream(format!("Failed to build input stream: {}", e)))
}

fn output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<SampleQueue>,
    enabled: Arc<AtomicBool>,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let active = enabled.load(Ordering::Acquire);
                let mut pending = queue.lock();
                for slot in data.iter_mut() {
                    *slot = match pending.pop_front().filter(|_| active) {
                        Some(sample) => T::from_sample(sample),
                        None => T::EQUILIBRIUM,
                    };
                }
            },
            |err| log::error!("CPAL output stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Stream(format!("Failed to build output stream: {}", e)))
}
