// Rust SFU data-plane core
//
// This library implements the forwarding and connection-lifecycle core of a
// Selective Forwarding Unit (SFU): per-stream fan-out with keyframe caching,
// per-session connection registries with reconnect-race detection, and a
// worker that glues inbound tracks to the fan-out engine.

pub mod registry;
pub mod media;
pub mod feedback;
pub mod forwarder;
pub mod signaling;
pub mod transport;
pub mod connection;
pub mod session;
pub mod worker;

/// Error types for the SFU
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum SfuError {
        /// Operation attempted before the underlying transport or connection exists
        #[error("Not initialized: {0}")]
        NotInitialized(String),

        /// Unknown stream id, connection id, session id or sender
        #[error("Not found: {0}")]
        NotFound(String),

        /// Malformed description type or undecodable payload
        #[error("Invalid input: {0}")]
        InvalidInput(String),

        /// Propagated from the transport layer
        #[error("Transport failure: {0}")]
        TransportFailure(String),

        /// Soft error: the action was skipped, not failed
        #[error("Duplicate suppressed: {0}")]
        DuplicateSuppressed(String),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl SfuError {
        /// Whether the error only signals a skipped action
        pub fn is_soft(&self) -> bool {
            matches!(self, SfuError::DuplicateSuppressed(_))
        }
    }

    pub type Result<T> = std::result::Result<T, SfuError>;
}

pub use error::{Result, SfuError};

pub use connection::{Connection, ConnectionConfig, Role};
pub use forwarder::{manager::ForwarderManager, Forwarder};
pub use media::{Wrapper, TrackKind};
pub use registry::ConcurrentRegistry;
pub use session::{ConnectionHandlers, ConnectionRegistry, IceState};
pub use worker::{UpPeer, Worker, WorkerConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging for the SFU
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}

/// Milliseconds since the unix epoch
pub(crate) fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
