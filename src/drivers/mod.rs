//! Sensor drivers. Each one owns an [`I2cDevice`](crate::hal::I2cDevice) and
//! speaks its chip's command set on top of it.

pub mod aht20;
pub mod bh1750;
pub mod bmp280;

use crate::hal::BusError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed. Never retried inside a single attempt.
    #[error(transparent)]
    Io(#[from] BusError),
    /// Status polled while a conversion was running.
    #[error("sensor busy")]
    Busy,
    /// The conversion never completed within the poll budget.
    #[error("timeout")]
    Timeout,
    #[error("sampling cancelled")]
    Cancelled,
    #[error("unexpected chip id 0x{0:02X}")]
    UnexpectedChipId(u8),
    #[error("invalid calibration data")]
    InvalidCalibration,
}
