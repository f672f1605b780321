use std::net::SocketAddr;

use thiserror::Error;
use tokenvault_store::StoreError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The loopback listener could not acquire its port.
    #[error("failed to bind broker listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The serving task failed or panicked.
    #[error("broker server failed: {0}")]
    Server(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
