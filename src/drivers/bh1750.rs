//! BH1750 ambient light driver, one-time high resolution mode (1 lx).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::Error;
use crate::hal::{I2cBus, I2cDevice};

/// ADDR pin low. 0x5C with ADDR high.
pub const ADDRESS: u8 = 0x23;

const CMD_POWER_ON: u8 = 0x01;
const CMD_ONE_TIME_HIGH_RES: u8 = 0x20;
/// Worst case from the datasheet; typical is 120 ms.
const MEASURE_DELAY: Duration = Duration::from_millis(180);

pub struct Bh1750<B> {
    dev: I2cDevice<B>,
}

impl<B: I2cBus> Bh1750<B> {
    pub fn new(bus: Arc<B>, address: u8) -> Self {
        Self {
            dev: I2cDevice::new(bus, address),
        }
    }

    /// Illuminance in lux. The chip powers down again after the measurement.
    pub async fn measure(&mut self) -> Result<f32, Error> {
        self.dev.transmit(&[CMD_POWER_ON])?;
        self.dev.transmit(&[CMD_ONE_TIME_HIGH_RES])?;
        sleep(MEASURE_DELAY).await;

        let mut data = [0u8; 2];
        self.dev.receive(&mut data)?;
        Ok(lux(u16::from_be_bytes(data)))
    }
}

fn lux(raw: u16) -> f32 {
    raw as f32 / 1.2
}
