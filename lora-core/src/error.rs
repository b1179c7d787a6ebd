//! Crate-level error.

use crate::protocol::MAX_DRIVER_FRAME;
use crate::radio::DriverError;
use crate::stream::StreamAnomaly;
use crate::wire::{DecodeError, EncodeError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("frame of {0} bytes exceeds driver limit {MAX_DRIVER_FRAME}")]
    FrameTooLong(usize),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("stream: {0}")]
    Stream(#[from] StreamAnomaly),
}

pub type Result<T> = std::result::Result<T, Error>;
