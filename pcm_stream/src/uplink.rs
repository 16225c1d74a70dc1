use crate::connection::SessionBody;
use crate::device::AudioDevice;
use crate::error;
use crate::types::{BlockFormat, BlockFormatError};
use log::{debug, info};
use pcm_protocol::{encode_samples_into, Direction, HEADER_LEN};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Capture → frame → socket.
///
/// The block and frame buffers are sized once from the device's capture
/// format and reused for every frame.
pub struct Uplink<D: AudioDevice + ?Sized> {
    device: Arc<D>,
    format: BlockFormat,
    block: Vec<i16>,
    frame: Vec<u8>,
    poll_interval: Duration,
    blocks_sent: u64,
}

impl<D: AudioDevice + ?Sized> Uplink<D> {
    pub fn new(device: Arc<D>, poll_interval: Duration) -> Result<Self, BlockFormatError> {
        let format = device.input_format();
        format.validate()?;

        info!(
            "🎤 Uplink blocks: {} ({} samples, {} bytes)",
            format,
            format.samples_per_block(),
            format.block_bytes()
        );

        Ok(Self {
            device,
            format,
            block: vec![0; format.samples_per_block()],
            frame: Vec::with_capacity(HEADER_LEN + format.block_bytes()),
            poll_interval,
            blocks_sent: 0,
        })
    }

    pub fn format(&self) -> BlockFormat {
        self.format
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    /// Wait for the next capture block. "No data yet" is backpressure, not a
    /// fault, so the connection is left alone while polling.
    fn next_block(&mut self) {
        if !self.device.is_input_enabled() {
            self.device.enable_input(true);
        }
        while !self.device.produce_input_block(&mut self.block) {
            thread::sleep(self.poll_interval);
        }
    }
}

impl<S: Write, D: AudioDevice + ?Sized> SessionBody<S> for Uplink<D> {
    fn step(&mut self, stream: &mut S) -> error::Result<()> {
        self.next_block();

        encode_samples_into(Direction::Uplink, &self.block, &mut self.frame)?;
        stream.write_all(&self.frame)?;
        stream.flush()?;

        self.blocks_sent += 1;
        if self.blocks_sent % 500 == 0 {
            debug!("🎵 Uplink sent {} blocks", self.blocks_sent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use pcm_protocol::{decode_header, FrameHeader};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Capture reports "no data" for the first `empty_polls` polls.
    struct SlowCapture {
        empty_polls: usize,
        polls: AtomicUsize,
        poll_times: Mutex<Vec<Instant>>,
        enabled: AtomicBool,
        enable_calls: AtomicUsize,
    }

    impl SlowCapture {
        fn new(empty_polls: usize) -> Self {
            Self {
                empty_polls,
                polls: AtomicUsize::new(0),
                poll_times: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(false),
                enable_calls: AtomicUsize::new(0),
            }
        }
    }

    impl AudioDevice for SlowCapture {
        fn input_sample_rate(&self) -> u32 {
            24000
        }
        fn input_channels(&self) -> u16 {
            1
        }
        fn is_input_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
        fn enable_input(&self, enable: bool) {
            self.enable_calls.fetch_add(1, Ordering::SeqCst);
            self.enabled.store(enable, Ordering::SeqCst);
        }
        fn produce_input_block(&self, block: &mut [i16]) -> bool {
            self.poll_times.lock().unwrap().push(Instant::now());
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            if poll < self.empty_polls {
                return false;
            }
            for (i, sample) in block.iter_mut().enumerate() {
                *sample = i as i16;
            }
            true
        }
        fn is_output_enabled(&self) -> bool {
            false
        }
        fn enable_output(&self, _enable: bool) {}
        fn consume_output_block(&self, _block: &[i16]) -> bool {
            false
        }
    }

    /// Accepts `ok_writes` writes, then reports a broken pipe.
    struct FailingWriter {
        ok_writes: usize,
        written: Vec<u8>,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.ok_writes == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.ok_writes -= 1;
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_step_writes_one_block_frame() {
        let device = Arc::new(SlowCapture::new(0));
        let mut uplink = Uplink::new(Arc::clone(&device), Duration::from_millis(5)).unwrap();
        let mut wire = Vec::new();

        uplink.step(&mut wire).unwrap();

        assert_eq!(wire.len(), HEADER_LEN + 960);
        let header = decode_header(wire[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header, FrameHeader::new(Direction::Uplink, 960));
        assert_eq!(&wire[HEADER_LEN + 2..HEADER_LEN + 4], &1i16.to_le_bytes());
        assert!(device.is_input_enabled());
        assert_eq!(uplink.blocks_sent(), 1);
    }

    #[test]
    fn test_capture_enabled_once() {
        let device = Arc::new(SlowCapture::new(0));
        let mut uplink = Uplink::new(Arc::clone(&device), Duration::from_millis(5)).unwrap();
        let mut wire = Vec::new();
        for _ in 0..3 {
            uplink.step(&mut wire).unwrap();
        }
        assert_eq!(device.enable_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_polls_wait_poll_interval() {
        let device = Arc::new(SlowCapture::new(4));
        let poll_interval = Duration::from_millis(5);
        let mut uplink = Uplink::new(Arc::clone(&device), poll_interval).unwrap();
        let mut wire = Vec::new();

        uplink.step(&mut wire).unwrap();

        let times = device.poll_times.lock().unwrap();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= poll_interval);
        }
        assert_eq!(wire.len(), HEADER_LEN + 960);
    }

    #[test]
    fn test_write_failure_ends_step() {
        let device = Arc::new(SlowCapture::new(0));
        let mut uplink = Uplink::new(device, Duration::from_millis(5)).unwrap();
        let mut writer = FailingWriter {
            ok_writes: 2,
            written: Vec::new(),
        };

        uplink.step(&mut writer).unwrap();
        uplink.step(&mut writer).unwrap();
        let err = uplink.step(&mut writer).unwrap_err();
        assert!(matches!(err, StreamError::Transport(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(writer.written.len(), 2 * (HEADER_LEN + 960));
    }
}
