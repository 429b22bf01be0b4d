use std::io;
use shared::pdu::EncodeError;
use shared::types::ServiceKey;
use thiserror::Error;

/// Failures reported by the relay, directory and discovery components.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("mDNS registration failed: {0}")]
    RegistrationFailed(String),

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("relay server is not listening")]
    NotListening,

    #[error("relay server is already started")]
    AlreadyListening,

    #[error("no service selected")]
    NoSelection,

    #[error("already subscribed to {0}")]
    AlreadySubscribed(ServiceKey),

    #[error("unknown service {0}")]
    UnknownService(ServiceKey),

    #[error("failed to encode PDU: {0}")]
    Encode(#[from] EncodeError),

    #[error("{0} is no longer running")]
    Unavailable(&'static str),
}
