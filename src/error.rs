#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid item, packet, protocol, or stream definition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Read or write outside the bounds of a buffer.
    #[error("{0}")]
    Bounds(String),

    /// Value cannot be represented by the destination field.
    #[error("{0}")]
    Overflow(String),

    /// CCSDS segment or framing sequence violation.
    #[error("segmentation error: {0}")]
    Segmentation(String),

    /// Malformed framing detected by a protocol, e.g., a bad length or CRC.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

impl Error {
    /// True for errors that only affect the frame or packet being processed. The reader
    /// drops the frame and keeps going.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Bounds(_) | Error::Overflow(_) | Error::Segmentation(_) | Error::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
