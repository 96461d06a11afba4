//! Fatal errors of the bridge engine.

/// Errors that stop the bridge.
///
/// Frame validation problems are not part of this type; they are retried
/// inside [`crate::transport::Session`] and never reach the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Writing to or reading from the byte stream failed.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// The result type of the bridge engine.
pub type Result<T> = std::result::Result<T, Error>;
