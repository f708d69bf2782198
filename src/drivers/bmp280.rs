//! BMP280 barometric pressure / temperature driver.
//!
//! Runs the chip in forced mode: one conversion per `measure`, then it goes
//! back to sleep. Compensation is the floating point variant from the Bosch
//! datasheet (section 8.1).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::Error;
use crate::hal::{I2cBus, I2cDevice};

/// SDO pulled low. 0x77 with SDO high.
pub const ADDRESS: u8 = 0x76;

const CHIP_ID: u8 = 0x58;
const REG_CHIP_ID: u8 = 0xD0;
const REG_CALIBRATION: u8 = 0x88;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

/// osrs_t x1, osrs_p x4, forced mode ("standard resolution").
const CTRL_FORCED_STANDARD: u8 = 0b001_011_01;
/// Max conversion time at standard resolution is 13.3 ms.
const MEASURE_DELAY: Duration = Duration::from_millis(20);

pub const SEA_LEVEL_PA: f32 = 101_325.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
}

impl Calibration {
    pub fn from_bytes(b: &[u8; 24]) -> Result<Self, Error> {
        let u = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([b[i], b[i + 1]]);

        let calibration = Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
        };

        // p1 divides the pressure result, an erased nvm reads back as zero
        if calibration.p1 == 0 {
            return Err(Error::InvalidCalibration);
        }
        Ok(calibration)
    }

    pub fn compensate(&self, adc_t: i32, adc_p: i32) -> Measurement {
        let adc_t = adc_t as f64;
        let adc_p = adc_p as f64;

        let var1 = (adc_t / 16384.0 - self.t1 as f64 / 1024.0) * self.t2 as f64;
        let var2 = (adc_t / 131072.0 - self.t1 as f64 / 8192.0).powi(2) * self.t3 as f64;
        let t_fine = var1 + var2;
        let celsius = t_fine / 5120.0;

        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.p6 as f64 / 32768.0;
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;
        if var1 == 0.0 {
            // would divide by zero, the datasheet reports 0 Pa
            return Measurement {
                celsius: celsius as f32,
                pressure: 0.0,
            };
        }

        let mut p = 1048576.0 - adc_p;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.p9 as f64 * p * p / 2147483648.0;
        let var2 = p * self.p8 as f64 / 32768.0;
        p += (var1 + var2 + self.p7 as f64) / 16.0;

        Measurement {
            celsius: celsius as f32,
            pressure: p as f32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub celsius: f32,
    /// Pascal.
    pub pressure: f32,
}

impl Measurement {
    /// Altitude in meters from the international barometric formula.
    pub fn altitude(&self, sea_level_pa: f32) -> f32 {
        44330.0 * (1.0 - (self.pressure / sea_level_pa).powf(1.0 / 5.255))
    }
}

pub struct Bmp280<B> {
    dev: I2cDevice<B>,
    calibration: Calibration,
}

impl<B: I2cBus> Bmp280<B> {
    /// Checks the chip id and loads the factory calibration.
    pub fn init(bus: Arc<B>, address: u8) -> Result<Self, Error> {
        let mut dev = I2cDevice::new(bus, address);

        let mut id = [0u8; 1];
        dev.write_read(&[REG_CHIP_ID], &mut id)?;
        if id[0] != CHIP_ID {
            return Err(Error::UnexpectedChipId(id[0]));
        }

        let mut raw = [0u8; 24];
        dev.write_read(&[REG_CALIBRATION], &mut raw)?;
        let calibration = Calibration::from_bytes(&raw)?;

        Ok(Self { dev, calibration })
    }

    pub async fn measure(&mut self) -> Result<Measurement, Error> {
        self.dev.transmit(&[REG_CTRL_MEAS, CTRL_FORCED_STANDARD])?;
        sleep(MEASURE_DELAY).await;

        let mut data = [0u8; 6];
        self.dev.write_read(&[REG_DATA], &mut data)?;
        let adc_p = adc20(data[0], data[1], data[2]);
        let adc_t = adc20(data[3], data[4], data[5]);

        Ok(self.calibration.compensate(adc_t, adc_p))
    }
}

fn adc20(msb: u8, lsb: u8, xlsb: u8) -> i32 {
    (msb as i32) << 12 | (lsb as i32) << 4 | (xlsb as i32) >> 4
}
