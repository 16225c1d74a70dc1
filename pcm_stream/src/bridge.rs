//! Server end of the device link.
//!
//! Boards open two connections: one announced with `HELLO-UP` that carries
//! microphone frames in, one announced with `HELLO-DOWN` that takes speaker
//! frames out. The bridge fans uplink audio out to local subscribers, can
//! record it, and can loop it straight back to the board's speaker.

use crate::types::BlockFormat;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, error, info, warn};
use pcm_protocol::{
    le_bytes_to_samples, read_header, samples_to_le_bytes, write_frame, Direction, InvalidFrame,
    ProtocolError, DOWNLINK_HELLO, MAX_PAYLOAD_LEN, UPLINK_HELLO,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const SUBSCRIBER_QUEUE_BLOCKS: usize = 64;
const RECORD_FLUSH_BLOCKS: u32 = 50;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid frame: {0}")]
    Frame(#[from] InvalidFrame),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("No downlink connection registered")]
    NoDownlink,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address to listen on (use "127.0.0.1:0" for a random port)
    pub bind_address: String,
    /// Send every uplink block straight back to the board's speaker
    pub loopback: bool,
    /// Record uplink audio to this WAV file
    pub record: Option<PathBuf>,
    /// Format of the uplink audio, used for the recording header
    pub record_format: BlockFormat,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            loopback: false,
            record: None,
            record_format: BlockFormat::new(24000, 1),
        }
    }
}

struct Recorder {
    writer: WavWriter<BufWriter<File>>,
    unflushed_blocks: u32,
}

/// State shared by the accept loop and every board thread.
struct Shared {
    should_stop: AtomicBool,
    loopback: bool,
    next_board_id: AtomicUsize,
    /// Every open board socket, so `stop` can unblock their readers
    boards: Mutex<HashMap<usize, TcpStream>>,
    /// Current playback target; the newest downlink connection wins
    downlink: Mutex<Option<(usize, TcpStream)>>,
    subscribers: Mutex<Vec<Sender<Vec<i16>>>>,
    recorder: Mutex<Option<Recorder>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn stop(&self) {
        if self.should_stop.swap(true, Ordering::Relaxed) {
            return;
        }
        for (_, stream) in lock(&self.boards).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        lock(&self.downlink).take();

        if let Some(recorder) = lock(&self.recorder).take() {
            if let Err(e) = recorder.writer.finalize() {
                error!("Failed to finalize recording: {}", e);
            }
        }
    }

    fn subscribe(&self) -> Receiver<Vec<i16>> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE_BLOCKS);
        lock(&self.subscribers).push(tx);
        rx
    }

    fn publish(&self, samples: &[i16]) {
        lock(&self.subscribers).retain(|tx| match tx.try_send(samples.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Subscriber is behind, dropping a block");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn record(&self, samples: &[i16]) {
        let mut recorder = lock(&self.recorder);
        let Some(state) = recorder.as_mut() else {
            return;
        };

        for &sample in samples {
            if let Err(e) = state.writer.write_sample(sample) {
                error!("Failed to record uplink sample: {}", e);
                return;
            }
        }
        state.unflushed_blocks += 1;
        if state.unflushed_blocks >= RECORD_FLUSH_BLOCKS {
            state.unflushed_blocks = 0;
            if let Err(e) = state.writer.flush() {
                error!("Failed to flush recording: {}", e);
            }
        }
    }

    /// Write one downlink frame to the registered board. A board whose socket
    /// fails is unregistered.
    fn send_downlink(&self, payload: &[u8]) -> Result<(), BridgeError> {
        let mut downlink = lock(&self.downlink);
        let Some((board_id, stream)) = downlink.as_mut() else {
            return Err(BridgeError::NoDownlink);
        };

        if let Err(e) = write_frame(stream, Direction::Downlink, payload) {
            warn!("🔌 Board {} downlink write failed: {}", board_id, e);
            downlink.take();
            return Err(e.into());
        }
        Ok(())
    }
}

/// Accepts board connections and routes their audio.
pub struct BridgeServer {
    config: BridgeConfig,
    shared: Arc<Shared>,
    actual_port: Option<u16>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let recorder = match &config.record {
            Some(path) => {
                let spec = WavSpec {
                    channels: config.record_format.channels,
                    sample_rate: config.record_format.sample_rate,
                    bits_per_sample: 16,
                    sample_format: SampleFormat::Int,
                };
                info!(
                    "💾 Recording uplink to {} ({})",
                    path.display(),
                    config.record_format
                );
                Some(Recorder {
                    writer: WavWriter::create(path, spec)?,
                    unflushed_blocks: 0,
                })
            }
            None => None,
        };

        info!("🎵 Bridge configured:");
        info!("  📡 Address: {}", config.bind_address);
        info!("  🔁 Loopback: {}", config.loopback);

        Ok(Self {
            shared: Arc::new(Shared {
                should_stop: AtomicBool::new(false),
                loopback: config.loopback,
                next_board_id: AtomicUsize::new(1),
                boards: Mutex::new(HashMap::new()),
                downlink: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                recorder: Mutex::new(recorder),
            }),
            config,
            actual_port: None,
        })
    }

    /// Bind and start accepting in a background thread. Returns the bound port.
    pub fn start(&mut self) -> Result<u16, BridgeError> {
        let listener = TcpListener::bind(&self.config.bind_address)?;
        listener.set_nonblocking(true)?;
        let actual_port = listener.local_addr()?.port();
        self.actual_port = Some(actual_port);

        info!("🎵 Bridge listening on {}", listener.local_addr()?);

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("pcm-bridge-accept".to_string())
            .spawn(move || Self::accept_loop(listener, shared))?;

        Ok(actual_port)
    }

    /// Start the server and return a handle that stops it when dropped.
    pub fn start_background(mut self) -> Result<BridgeHandle, BridgeError> {
        let port = self.start()?;
        Ok(BridgeHandle {
            port,
            shared: Arc::clone(&self.shared),
            _server: self,
        })
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn port(&self) -> Option<u16> {
        self.actual_port
    }

    pub fn subscribe(&self) -> Receiver<Vec<i16>> {
        self.shared.subscribe()
    }

    /// Send one block of samples to the board's speaker.
    pub fn send_downlink(&self, samples: &[i16]) -> Result<(), BridgeError> {
        self.shared.send_downlink(&samples_to_le_bytes(samples))
    }

    fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        while !shared.should_stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let board_id = shared.next_board_id.fetch_add(1, Ordering::Relaxed);
                    info!("📡 Board {} connected from {}", board_id, peer);
                    if let Err(e) = Self::spawn_board(stream, board_id, peer, &shared) {
                        error!("Failed to set up board {}: {}", board_id, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    error!("Connection error: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        info!("🛑 Bridge stopped accepting");
    }

    fn spawn_board(
        stream: TcpStream,
        board_id: usize,
        peer: SocketAddr,
        shared: &Arc<Shared>,
    ) -> io::Result<()> {
        // Accepted sockets may inherit non-blocking mode from the listener
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        lock(&shared.boards).insert(board_id, stream.try_clone()?);

        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("pcm-board-{}", board_id))
            .spawn(move || {
                match Self::handle_board(stream, board_id, &shared) {
                    Ok(()) => info!("🔌 Board {} ({}) disconnected", board_id, peer),
                    Err(e) if shared.should_stop.load(Ordering::Relaxed) => {
                        debug!("Board {} closed on shutdown: {}", board_id, e)
                    }
                    Err(e) => warn!("🔌 Board {} ({}) dropped: {}", board_id, peer, e),
                }
                lock(&shared.boards).remove(&board_id);
            })?;
        Ok(())
    }

    fn handle_board(
        mut stream: TcpStream,
        board_id: usize,
        shared: &Shared,
    ) -> Result<(), BridgeError> {
        let mut hello = [0u8; 10];
        stream.read_exact(&mut hello[..UPLINK_HELLO.len()])?;
        if &hello[..UPLINK_HELLO.len()] == UPLINK_HELLO {
            return Self::serve_uplink(stream, board_id, shared);
        }

        stream.read_exact(&mut hello[UPLINK_HELLO.len()..])?;
        if &hello[..] == DOWNLINK_HELLO {
            return Self::serve_downlink(stream, board_id, shared);
        }

        warn!(
            "⚠️ Board {} sent unknown handshake {:?}",
            board_id,
            String::from_utf8_lossy(&hello)
        );
        Ok(())
    }

    fn serve_uplink(
        mut stream: TcpStream,
        board_id: usize,
        shared: &Shared,
    ) -> Result<(), BridgeError> {
        info!("🎤 Board {} streaming uplink", board_id);

        let mut payload = vec![0u8; MAX_PAYLOAD_LEN];
        let mut samples = vec![0i16; MAX_PAYLOAD_LEN / 2];
        let mut block_count: u64 = 0;

        loop {
            let header = match read_header(&mut stream) {
                Ok(header) => header.expect_pcm(Direction::Uplink)?,
                Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let payload = &mut payload[..header.payload_len()];
            stream.read_exact(payload)?;
            let count = le_bytes_to_samples(payload, &mut samples);

            shared.record(&samples[..count]);
            shared.publish(&samples[..count]);
            if shared.loopback {
                match shared.send_downlink(payload) {
                    Ok(()) | Err(BridgeError::NoDownlink) => {}
                    Err(e) => debug!("Loopback dropped a block: {}", e),
                }
            }

            block_count += 1;
            if block_count % 500 == 0 {
                debug!("🎵 Board {} sent {} uplink blocks", board_id, block_count);
            }
        }
    }

    fn serve_downlink(
        mut stream: TcpStream,
        board_id: usize,
        shared: &Shared,
    ) -> Result<(), BridgeError> {
        let previous = lock(&shared.downlink).replace((board_id, stream.try_clone()?));
        if let Some((previous_id, _)) = previous {
            info!(
                "🔊 Board {} replaces board {} as playback target",
                board_id, previous_id
            );
        } else {
            info!("🔊 Board {} registered for downlink", board_id);
        }

        // Boards never send on this connection; reading only detects the close
        let mut scratch = [0u8; 256];
        let result = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => debug!("Board {} sent {} stray bytes on downlink", board_id, n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e.into()),
            }
        };

        let mut downlink = lock(&shared.downlink);
        if matches!(downlink.as_ref(), Some((id, _)) if *id == board_id) {
            downlink.take();
        }
        result
    }
}

/// Handle for a bridge running in the background
pub struct BridgeHandle {
    pub port: u16,
    shared: Arc<Shared>,
    _server: BridgeServer,
}

impl BridgeHandle {
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn subscribe(&self) -> Receiver<Vec<i16>> {
        self.shared.subscribe()
    }

    pub fn send_downlink(&self, samples: &[i16]) -> Result<(), BridgeError> {
        self.shared.send_downlink(&samples_to_le_bytes(samples))
    }

    pub fn has_downlink(&self) -> bool {
        lock(&self.shared.downlink).is_some()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
