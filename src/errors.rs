//! Error types for the TCAP layer

use crate::dialogue::Diagnostic;
use crate::messages::AbortCause;
use crate::types::TransactionId;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, TcapError>;

/// Top-level TCAP error
#[derive(Debug, Error)]
pub enum TcapError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transaction not found: {0:#010x}")]
    TransactionNotFound(TransactionId),

    #[error("mailbox occupied for transaction {0:#010x}")]
    MailboxOccupied(TransactionId),

    #[error("dialogue rejected by peer: {0:?}")]
    DialogueRejected(Diagnostic),

    #[error("dialogue mismatch: {0}")]
    DialogueMismatch(&'static str),

    #[error("abort received: {0:?}")]
    Abort(AbortCause),

    #[error("invocation timer expired")]
    Timeout,

    #[error("unsupported message: {0}")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Codec errors
///
/// Fatal to the message being parsed; where a transaction id is
/// recoverable, the dispatcher answers with a protocol abort.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    Truncated,

    #[error("unrecognized tag 0x{0:02X}")]
    UnrecognizedTag(u8),

    #[error("expected tag 0x{expected:02X}, got 0x{actual:02X}")]
    TagMismatch { expected: u8, actual: u8 },

    #[error("bad length for {0}")]
    BadLength(&'static str),

    #[error("unknown operation code {0}")]
    UnknownOperation(u8),

    #[error("unknown error code {0}")]
    UnknownError(u8),

    #[error("unsupported dialogue protocol version")]
    VersionMismatch,

    #[error("bad object identifier")]
    BadOid,

    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
