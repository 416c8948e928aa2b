use std::io;

use thiserror::Error;

use crate::image::ImageError;
use crate::isp::ReturnCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error when opening serial port {}: {}", _0, _1)]
    SerialOpenError(String, serialport::Error),
    #[error("Serial link is not open")]
    NotOpen,
    #[error("Transport error: {}", _0)]
    TransportError(#[from] io::Error),
    /// No acceptable response arrived within the retry budget
    #[error("Timed out waiting for a response from the bootloader")]
    TimeoutError,
    #[error("Bootloader returned error {}: {}", .0.code(), .0)]
    ProtocolError(ReturnCode),
    #[error("Malformed response from the bootloader: {}", _0)]
    MalformedResponse(String),
    #[error("Short read - expected {} bytes but got {}", expected, actual)]
    ShortRead { expected: usize, actual: usize },
    #[error("Synchronization failed after {} attempt(s)", _0)]
    SynchronizationFailure(u32),
    #[error("Verification failed - mismatch at address {:#010x}", address)]
    CompareError { address: u32 },
    #[error("Image error: {}", _0)]
    ImageLoadError(#[from] ImageError),
    #[error("Could not drive signal {}: {}", _0, _1)]
    SignalError(String, io::Error),
    #[error("Sector {} is out of range, the device has {} sectors", sector, count)]
    InvalidSector { sector: u32, count: u32 },
    #[error("Operation cancelled")]
    Cancelled,
}
