//! Errors surfaced by every controller operation.
use crate::protocol as proto;

/// Represents all possible errors of a temperature controller operation.
///
/// Lower level failures never leak through: transport I/O errors become
/// [`Error::ConnectionFailure`], undecodable replies [`Error::Protocol`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport is closed, could not be opened or failed mid round trip.
    #[error("Connection to the instrument failed: {0}")]
    ConnectionFailure(#[from] std::io::Error),

    /// The instrument replied, but not in the expected grammar.
    #[error("Protocol error: {0}")]
    Protocol(#[from] proto::ResponseError),

    /// A value outside of its documented domain. Nothing was sent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] proto::ArgumentError),

    /// The capability is not present on this instrument model.
    #[error("The current instrument does not support {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub(crate) fn not_connected() -> Self {
        Error::ConnectionFailure(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "instrument is not connected",
        ))
    }

    /// Returns `true` if the link to the instrument is down.
    ///
    /// Pollers treat this as "mark disconnected, keep polling" and every other
    /// kind as a failed reading cycle.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }
}

/// The result type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;
