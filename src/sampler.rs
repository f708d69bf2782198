//! ==============================================================================
//! sampler.rs - one sampling cycle over every attached sensor
//! ==============================================================================
//!
//! the sensors are read strictly one after the other. a failing sensor is
//! logged, its error string goes into the sample, and the cycle moves on to
//! the next one.
//!
//! relationships:
//!     - used by: station.rs (the only owner, so the drivers are never reentered)
//!     - uses: drivers/*.rs
//!
//! ==============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SensorsConfig;
use crate::domain::SensorSample;
use crate::drivers::aht20::{Aht20, RetryPolicy};
use crate::drivers::bh1750::Bh1750;
use crate::drivers::bmp280::{self, Bmp280};
use crate::drivers::Error;
use crate::hal::I2cBus;

struct Aht20Slot<B> {
    driver: Aht20<B>,
    policy: RetryPolicy,
    configured: bool,
}

impl<B: I2cBus> Aht20Slot<B> {
    async fn measure(&mut self, cancel: &CancellationToken) -> Result<(f32, f32), Error> {
        if !self.configured {
            self.driver.configure().await?;
            self.configured = true;
        }

        match self.driver.measure(self.policy, cancel).await {
            Ok(raw) => Ok((raw.celsius(), raw.relative_humidity())),
            Err(e) => {
                // calibrate again before the next cycle
                self.configured = false;
                Err(e)
            }
        }
    }
}

/// The bmp280 needs its calibration read before use. It is (re)loaded on the
/// first cycle and on the cycle after any failure.
struct Bmp280Slot<B> {
    address: u8,
    sea_level_pa: f32,
    driver: Option<Bmp280<B>>,
}

impl<B: I2cBus> Bmp280Slot<B> {
    async fn measure(&mut self, bus: &Arc<B>) -> Result<bmp280::Measurement, Error> {
        let mut driver = match self.driver.take() {
            Some(driver) => driver,
            None => {
                debug!("initializing BMP280 at 0x{:02X}", self.address);
                Bmp280::init(bus.clone(), self.address)?
            }
        };

        let res = driver.measure().await;
        if res.is_ok() {
            self.driver = Some(driver);
        }
        res
    }
}

pub struct Sampler<B> {
    bus: Arc<B>,
    aht20: Option<Aht20Slot<B>>,
    bmp280: Option<Bmp280Slot<B>>,
    bh1750: Option<Bh1750<B>>,
}

impl<B: I2cBus> Sampler<B> {
    /// Disabled sensors are left out entirely; nothing touches the bus here.
    pub fn new(bus: Arc<B>, sensors: &SensorsConfig) -> Self {
        let aht20 = sensors.aht20.enabled.then(|| Aht20Slot {
            driver: Aht20::with_address(bus.clone(), sensors.aht20.address),
            policy: sensors.aht20.retry_policy(),
            configured: false,
        });
        let bmp280 = sensors.bmp280.enabled.then(|| Bmp280Slot {
            address: sensors.bmp280.address,
            sea_level_pa: sensors.bmp280.sea_level_pa,
            driver: None,
        });
        let bh1750 = sensors
            .bh1750
            .enabled
            .then(|| Bh1750::new(bus.clone(), sensors.bh1750.address));

        Self {
            bus,
            aht20,
            bmp280,
            bh1750,
        }
    }

    pub async fn sample(&mut self, cancel: &CancellationToken) -> SensorSample {
        let started = Instant::now();
        let mut sample = SensorSample {
            time: Utc::now(),
            ..Default::default()
        };

        if let Some(bmp) = &mut self.bmp280 {
            match bmp.measure(&self.bus).await {
                Ok(m) => {
                    sample.temperature = Some(m.celsius);
                    sample.pressure = Some(m.pressure);
                    sample.altitude = Some(m.altitude(bmp.sea_level_pa));
                }
                Err(e) => {
                    warn!("[BMP280] ⚠ Read error: {}", e);
                    sample.bmp280_err = Some(e.to_string());
                }
            }
        }

        if let Some(bh) = &mut self.bh1750 {
            match bh.measure().await {
                Ok(lux) => sample.illuminance = Some(lux),
                Err(e) => {
                    warn!("[BH1750] ⚠ Read error: {}", e);
                    sample.bh1750_err = Some(e.to_string());
                }
            }
        }

        if let Some(aht) = &mut self.aht20 {
            match aht.measure(cancel).await {
                Ok((celsius, humidity)) => {
                    sample.aht20_temperature = Some(celsius);
                    sample.humidity = Some(humidity);
                }
                Err(e) => {
                    warn!("[AHT20] ⚠ Read error: {}", e);
                    sample.aht20_err = Some(e.to_string());
                }
            }
        }

        sample.time_consuming = started.elapsed().as_secs_f32();
        sample
    }
}
