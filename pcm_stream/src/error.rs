use pcm_protocol::{InvalidFrame, ProtocolError};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Why a streaming connection ended.
///
/// Every variant is recoverable: the lifecycle reacts to all of them by
/// dropping the connection and reconnecting after a delay.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] InvalidFrame),
}

impl From<ProtocolError> for StreamError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => StreamError::Transport(e),
            ProtocolError::Invalid(e) => StreamError::Protocol(e),
        }
    }
}

impl StreamError {
    /// True when the peer closed its half of the connection.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof
        )
    }
}
