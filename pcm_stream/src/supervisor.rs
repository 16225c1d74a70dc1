use crate::config::{StreamConfig, StreamTiming};
use crate::connection::{Connector, Link, TcpConnector};
use crate::device::AudioDevice;
use crate::downlink::Downlink;
use crate::types::{BlockFormatError, StreamEndpoint};
use crate::uplink::Uplink;
use log::{error, info, warn};
use pcm_protocol::Direction;
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the supervisor checks on its loop threads.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the uplink and downlink loops side by side, each on its own thread
/// with its own connection. Neither direction waits on the other.
pub struct Supervisor<C = TcpConnector> {
    endpoint: StreamEndpoint,
    device: Arc<dyn AudioDevice>,
    connector: C,
    timing: StreamTiming,
}

impl Supervisor<TcpConnector> {
    pub fn new(config: StreamConfig, device: Arc<dyn AudioDevice>) -> Result<Self, BlockFormatError> {
        Self::with_connector(config, device, TcpConnector)
    }
}

impl<C> Supervisor<C>
where
    C: Connector + Clone + Send + 'static,
{
    /// Fails when the device's capture format cannot be framed, so a bad
    /// setup is reported before any connection is attempted.
    pub fn with_connector(
        config: StreamConfig,
        device: Arc<dyn AudioDevice>,
        connector: C,
    ) -> Result<Self, BlockFormatError> {
        device.input_format().validate()?;

        Ok(Self {
            endpoint: config.endpoint,
            device,
            connector,
            timing: config.timing,
        })
    }

    /// Spawn both loops and hand back their threads.
    pub fn start(&self) -> Vec<(Direction, JoinHandle<()>)> {
        info!(
            "🚀 Streaming with {} (capture {})",
            self.endpoint,
            self.device.input_format()
        );
        [Direction::Uplink, Direction::Downlink]
            .into_iter()
            .map(|direction| (direction, self.spawn(direction)))
            .collect()
    }

    /// Start both loops and keep them alive forever. A loop thread only ends
    /// by panicking; it is replaced after the close delay.
    pub fn run(self) -> ! {
        let mut workers: Vec<(Direction, Option<JoinHandle<()>>)> = self
            .start()
            .into_iter()
            .map(|(direction, handle)| (direction, Some(handle)))
            .collect();

        loop {
            thread::sleep(WATCH_INTERVAL);
            self.watch_once(&mut workers);
        }
    }

    /// Reap every finished loop thread and replace it after the close delay.
    /// Returns how many loops were restarted.
    fn watch_once(&self, workers: &mut [(Direction, Option<JoinHandle<()>>)]) -> usize {
        let mut restarted = 0;

        for (direction, slot) in workers.iter_mut() {
            let finished = slot.as_ref().map_or(true, JoinHandle::is_finished);
            if !finished {
                continue;
            }

            if let Some(handle) = slot.take() {
                match handle.join() {
                    Err(panic) => error!(
                        "💥 {} loop panicked: {}",
                        direction,
                        panic_message(panic.as_ref())
                    ),
                    Ok(()) => warn!("⚠️  {} loop exited unexpectedly", direction),
                }
            }

            thread::sleep(self.timing.close_delay);
            info!("🔄 Restarting {} loop", direction);
            *slot = Some(self.spawn(*direction));
            restarted += 1;
        }

        restarted
    }

    /// Spawn one direction's loop, retrying until the OS gives us a thread.
    fn spawn(&self, direction: Direction) -> JoinHandle<()> {
        loop {
            match self.try_spawn(direction) {
                Ok(handle) => return handle,
                Err(e) => {
                    error!("❌ Failed to spawn {} thread: {}", direction, e);
                    thread::sleep(self.timing.close_delay);
                }
            }
        }
    }

    fn try_spawn(&self, direction: Direction) -> std::io::Result<JoinHandle<()>> {
        let link = Link::new(
            direction,
            self.endpoint.clone(),
            self.connector.clone(),
            self.timing,
        );
        let device = Arc::clone(&self.device);
        let poll_interval = self.timing.poll_interval;

        thread::Builder::new()
            .name(format!("pcm-{}", direction))
            .spawn(move || match direction {
                Direction::Uplink => match Uplink::new(device, poll_interval) {
                    Ok(body) => link.run(body),
                    Err(e) => error!("❌ Uplink cannot start: {}", e),
                },
                Direction::Downlink => link.run(Downlink::new(device)),
            })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
