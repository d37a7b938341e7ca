use thiserror::Error;

/// An error that occurred when reading or writing a whole frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame of unsupported version {0}")]
    VersionNotSupported(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error("Frame compression failed")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unrecognized opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// An error that occurred when (de)serializing a frame body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not serialize frame: {0}")]
    BadDataToSerialize(String),
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
