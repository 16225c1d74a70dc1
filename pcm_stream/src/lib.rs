pub mod bridge;
pub mod config;
pub mod connection;
pub mod device;
pub mod downlink;
pub mod error;
pub mod supervisor;
pub mod types;
pub mod uplink;

pub use bridge::{BridgeConfig, BridgeError, BridgeHandle, BridgeServer};
pub use config::{load_config, ConfigError, ConfigLayer, StreamConfig, StreamTiming};
pub use connection::{BackoffPolicy, Connector, Link, LinkState, SessionBody, TcpConnector};
pub use device::{AudioDevice, CpalConfig, CpalDevice, DeviceError, WavDevice, WavDeviceConfig};
pub use downlink::Downlink;
pub use error::StreamError;
pub use supervisor::Supervisor;
pub use types::{BlockFormat, BlockFormatError, StreamEndpoint};
pub use uplink::Uplink;
