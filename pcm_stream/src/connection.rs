//! Connection lifecycle shared by both streaming directions.
//!
//! ```text
//! Disconnected → Connecting → Handshaking → Streaming → Closing → Disconnected
//!       ↑____________|  (connect failed, backoff)
//! ```
//!
//! Only the handshake token and the per-iteration body differ between uplink
//! and downlink. The loop never gives up and never returns.

use crate::config::StreamTiming;
use crate::error::{Result, StreamError};
use crate::types::StreamEndpoint;
use log::{debug, info, warn};
use pcm_protocol::Direction;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// Opens transport connections to the server.
pub trait Connector {
    type Stream: Read + Write + Send;

    fn connect(&self, endpoint: &StreamEndpoint) -> io::Result<Self::Stream>;
}

/// Plain blocking TCP, no timeouts beyond what the OS applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, endpoint: &StreamEndpoint) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", endpoint, e);
        }
        Ok(stream)
    }
}

/// Delay before retrying a failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// Doubles on every consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { initial, max } => {
                let doublings = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << doublings).min(max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_millis(2000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Handshaking => "handshaking",
            LinkState::Streaming => "streaming",
            LinkState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One iteration of work on a live connection.
///
/// Any error ends the connection; there is no partial recovery.
pub trait SessionBody<S> {
    fn step(&mut self, stream: &mut S) -> Result<()>;
}

/// Owns the reconnect loop for one direction.
pub struct Link<C: Connector> {
    direction: Direction,
    endpoint: StreamEndpoint,
    connector: C,
    timing: StreamTiming,
    state: LinkState,
    failed_attempts: u32,
}

impl<C: Connector> Link<C> {
    pub fn new(
        direction: Direction,
        endpoint: StreamEndpoint,
        connector: C,
        timing: StreamTiming,
    ) -> Self {
        Self {
            direction,
            endpoint,
            connector,
            timing,
            state: LinkState::Disconnected,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn transition(&mut self, next: LinkState) {
        debug!("🔀 {} link: {} → {}", self.direction, self.state, next);
        self.state = next;
    }

    /// Connect, retrying forever with backoff.
    pub fn connect(&mut self) -> C::Stream {
        loop {
            self.transition(LinkState::Connecting);
            match self.connector.connect(&self.endpoint) {
                Ok(stream) => {
                    self.failed_attempts = 0;
                    info!("✅ {} connected to {}", self.direction, self.endpoint);
                    return stream;
                }
                Err(source) => {
                    self.failed_attempts = self.failed_attempts.saturating_add(1);
                    let delay = self.timing.connect_backoff.delay(self.failed_attempts);
                    let err = StreamError::Connect {
                        endpoint: self.endpoint.to_string(),
                        source,
                    };
                    warn!(
                        "⚠️  {} {}; retrying in {:?} (attempt {})",
                        self.direction, err, delay, self.failed_attempts
                    );
                    self.transition(LinkState::Disconnected);
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Announce the direction, then run `body` until the connection fails.
    /// Returns what ended it.
    pub fn serve<B>(&mut self, stream: &mut C::Stream, body: &mut B) -> StreamError
    where
        B: SessionBody<C::Stream>,
    {
        self.transition(LinkState::Handshaking);
        let hello = self.direction.hello();
        if let Err(e) = stream.write_all(hello).and_then(|_| stream.flush()) {
            return StreamError::Transport(e);
        }

        self.transition(LinkState::Streaming);
        info!("🎵 {} streaming", self.direction);

        loop {
            if let Err(e) = body.step(stream) {
                return e;
            }
        }
    }

    /// The permanent connect → stream → close cycle.
    pub fn run<B>(mut self, mut body: B) -> !
    where
        B: SessionBody<C::Stream>,
    {
        loop {
            let mut stream = self.connect();
            let cause = self.serve(&mut stream, &mut body);

            self.transition(LinkState::Closing);
            if cause.is_eof() {
                info!("🔌 {} connection closed by server", self.direction);
            } else {
                warn!("🔌 {} connection dropped: {}", self.direction, cause);
            }
            drop(stream);

            self.transition(LinkState::Disconnected);
            thread::sleep(self.timing.close_delay);
        }
    }
}
