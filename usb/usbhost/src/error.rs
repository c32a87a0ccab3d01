use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::dma::DmaError;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a transfer finished without moving all of its data. Set only by the
/// host-controller layer when it reports a completion.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error, Serialize, Deserialize)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,
    #[error("babble detected")]
    Babble,
    #[error("transfer timed out")]
    TimedOut,
    #[error("transfer aborted")]
    Aborted,
    #[error("device no longer present")]
    Gone,
    #[error("host controller error")]
    Controller,
}

#[derive(Debug, Error)]
pub enum Error {
    /// DMA chunk pool or mapper exhaustion.
    #[error("out of DMA memory")]
    NoMemory,

    /// All 126 assignable bus addresses are in use.
    #[error("bus address space exhausted")]
    AddressExhausted,

    /// A control or data transfer failed on the wire.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Malformed or truncated descriptor data from the device.
    #[error("bad descriptor: {0}")]
    Descriptor(&'static str),

    /// Unknown id, ownership mismatch, or an otherwise impossible request.
    /// Rejected without any partial mutation.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Resubmission of a transfer that is not idle.
    #[error("transfer is busy")]
    Busy,

    #[error("no such device")]
    NoDevice,

    /// Device nested deeper than a location id can encode.
    #[error("hub tree too deep")]
    TooDeep,

    /// Port reset did not complete within the bounded retries.
    #[error("port reset timed out")]
    ResetTimeout,

    /// An external driver did not answer an insertion offer in time.
    #[error("driver did not reply")]
    NoReply,

    #[error("operation not supported")]
    Unsupported,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<DmaError> for Error {
    fn from(_: DmaError) -> Self {
        Self::NoMemory
    }
}

/// Wire representation of [`Error`] for replies to external drivers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoMemory,
    AddressExhausted,
    Transfer(TransferError),
    BadDescriptor,
    InvalidArgument,
    Busy,
    NoDevice,
    TooDeep,
    ResetTimeout,
    NoReply,
    Unsupported,
    BadConfig,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::NoMemory => Self::NoMemory,
            Error::AddressExhausted => Self::AddressExhausted,
            Error::Transfer(e) => Self::Transfer(*e),
            Error::Descriptor(_) => Self::BadDescriptor,
            Error::Invalid(_) => Self::InvalidArgument,
            Error::Busy => Self::Busy,
            Error::NoDevice => Self::NoDevice,
            Error::TooDeep => Self::TooDeep,
            Error::ResetTimeout => Self::ResetTimeout,
            Error::NoReply => Self::NoReply,
            Error::Unsupported => Self::Unsupported,
            Error::Config(_) => Self::BadConfig,
        }
    }
}
