use thiserror::Error;

/// Terminal status of a failed transfer. Recorded sticky on the transfer
/// (first error wins) and delivered exactly once through the driver
/// callback; the core never retries on its own.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum UsbError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stalled,

    #[error("device returned less data than requested")]
    ShortTransfer,

    #[error("frame length sum overflowed")]
    Overflow,

    #[error("malformed transfer parameters")]
    InvalidParameter,

    #[error("out of DMA memory")]
    ResourceExhausted,
}

pub type Result<T> = std::result::Result<T, UsbError>;
