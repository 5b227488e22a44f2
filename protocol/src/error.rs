//! Codec error types.

/// Errors produced while decoding frames on either transport.
///
/// `Incomplete` is special on the stream side: the bytes seen so far are a
/// valid prefix and must stay buffered until more arrive. Every other
/// variant is a framing error; the stream dispatcher counts it against the
/// peer's parse-error quota, and the datagram dispatcher drops the packet
/// silently.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("at least {0} more bytes required")]
    Incomplete(usize),
    #[error("invalid magic number: {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),
    #[error("unknown command: {0}")]
    UnknownCommand(u8),
    #[error("unknown channel: {0}")]
    UnknownChannel(u8),
    #[error("declared size {declared} does not match datagram length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("malformed UTF-8 string")]
    MalformedString,
}
