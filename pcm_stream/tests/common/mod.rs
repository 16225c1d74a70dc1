//! Scripted devices and transports shared by the integration tests.

#![allow(dead_code)]

use pcm_stream::{
    AudioDevice, BackoffPolicy, Connector, StreamEndpoint, StreamTiming, TcpConnector,
};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

pub fn fast_timing() -> StreamTiming {
    StreamTiming {
        connect_backoff: BackoffPolicy::Fixed(Duration::from_millis(20)),
        close_delay: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

/// In-memory device: capture produces a running sample counter, playback is
/// recorded block by block.
pub struct ScriptedDevice {
    sample_rate: u32,
    channels: u16,
    /// "No data" answers before each block becomes available
    empty_polls_per_block: usize,
    polls: AtomicUsize,
    pending_empty: AtomicUsize,
    next_sample: AtomicUsize,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    pub played: Mutex<Vec<Vec<i16>>>,
}

impl ScriptedDevice {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::with_empty_polls(sample_rate, channels, 0)
    }

    pub fn with_empty_polls(sample_rate: u32, channels: u16, empty_polls_per_block: usize) -> Self {
        Self {
            sample_rate,
            channels,
            empty_polls_per_block,
            polls: AtomicUsize::new(0),
            pending_empty: AtomicUsize::new(empty_polls_per_block),
            next_sample: AtomicUsize::new(0),
            input_enabled: AtomicBool::new(false),
            output_enabled: AtomicBool::new(false),
            played: Mutex::new(Vec::new()),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn played_blocks(&self) -> Vec<Vec<i16>> {
        self.played.lock().unwrap().clone()
    }

    /// Sample values the counter produces, for checking what went on the wire.
    pub fn expected_samples(start: usize, count: usize) -> Vec<i16> {
        (start..start + count).map(|n| n as i16).collect()
    }
}

impl AudioDevice for ScriptedDevice {
    fn input_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn input_channels(&self) -> u16 {
        self.channels
    }

    fn is_input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::SeqCst)
    }

    fn enable_input(&self, enable: bool) {
        self.input_enabled.store(enable, Ordering::SeqCst);
    }

    fn produce_input_block(&self, block: &mut [i16]) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.is_input_enabled() {
            return false;
        }
        if self.pending_empty.load(Ordering::SeqCst) > 0 {
            self.pending_empty.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.pending_empty
            .store(self.empty_polls_per_block, Ordering::SeqCst);

        let start = self.next_sample.fetch_add(block.len(), Ordering::SeqCst);
        for (i, sample) in block.iter_mut().enumerate() {
            *sample = (start + i) as i16;
        }
        true
    }

    fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    fn enable_output(&self, enable: bool) {
        self.output_enabled.store(enable, Ordering::SeqCst);
    }

    fn consume_output_block(&self, block: &[i16]) -> bool {
        if !self.is_output_enabled() {
            return false;
        }
        self.played.lock().unwrap().push(block.to_vec());
        true
    }
}

/// TCP connector whose streams start failing writes after `ok_writes`.
#[derive(Clone)]
pub struct FaultyConnector {
    pub ok_writes: usize,
    pub connects: Arc<Mutex<Vec<Instant>>>,
    pub failures: Arc<Mutex<Vec<Instant>>>,
}

impl FaultyConnector {
    pub fn new(ok_writes: usize) -> Self {
        Self {
            ok_writes,
            connects: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

pub struct FaultyStream {
    inner: TcpStream,
    writes_left: usize,
    failures: Arc<Mutex<Vec<Instant>>>,
}

impl Read for FaultyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FaultyStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writes_left == 0 {
            self.failures.lock().unwrap().push(Instant::now());
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        self.writes_left -= 1;
        // One call moves the whole buffer so write counts are predictable
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Connector for FaultyConnector {
    type Stream = FaultyStream;

    fn connect(&self, endpoint: &StreamEndpoint) -> io::Result<FaultyStream> {
        let inner = TcpConnector.connect(endpoint)?;
        self.connects.lock().unwrap().push(Instant::now());
        Ok(FaultyStream {
            inner,
            writes_left: self.ok_writes,
            failures: Arc::clone(&self.failures),
        })
    }
}

/// A listener on an ephemeral loopback port plus its endpoint.
pub fn listen() -> (TcpListener, StreamEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, StreamEndpoint::new("127.0.0.1", port))
}

/// Accept one connection or give up after `timeout`.
pub fn accept_within(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return Some(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2))
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
    None
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
