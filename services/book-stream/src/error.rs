use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::ingestion::IngestionError;
pub use crate::protocol::ProtocolError;
pub use crate::registry::RegistryError;
pub use crate::source::SourceError;

/// A client request that could not be honoured.
///
/// The `Display` text is what the client receives as `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
