use thiserror::Error;

/// The error taxonomy for the push replicator.
///
/// Only [`ReplicatorError::ProtocolViolation`] and
/// [`ReplicatorError::FilterResolution`] are fatal: everything else is
/// logged and absorbed by the caller so a single bad revision or a
/// rejected document doesn't poison the whole replication.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("filter {0:?} could not be resolved")]
    FilterResolution(String),

    #[error("failed to load {doc_id}/{rev_id} from the local store: {reason}")]
    LocalStore {
        doc_id: String,
        rev_id: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(String),
}

/// Transport-level errors, raised by the `RemoteTransport` implementation.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Transient network/DNS/TLS failures are retryable; a well-formed HTTP
    /// error response from the server is not (spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}
