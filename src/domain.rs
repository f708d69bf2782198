use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// one sampling cycle over all attached sensors
///
/// a sensor that failed leaves its values empty and fills its `*_err` field.
/// a disabled sensor leaves both empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub time: DateTime<Utc>,
    /// bmp280 temperature in celsius
    pub temperature: Option<f32>,
    /// aht20 temperature in celsius
    pub aht20_temperature: Option<f32>,
    /// relative humidity (0-100%)
    pub humidity: Option<f32>,
    /// pressure in Pa
    pub pressure: Option<f32>,
    /// altitude in meters
    pub altitude: Option<f32>,
    /// illuminance in lux
    pub illuminance: Option<f32>,
    /// seconds spent sampling
    pub time_consuming: f32,
    pub bmp280_err: Option<String>,
    pub bh1750_err: Option<String>,
    pub aht20_err: Option<String>,
}

impl SensorSample {
    pub fn has_errors(&self) -> bool {
        self.bmp280_err.is_some() || self.bh1750_err.is_some() || self.aht20_err.is_some()
    }
}

/// one call to the remote weather api
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub time: DateTime<Utc>,
    /// raw json body as returned by the api
    pub response: Option<String>,
    /// seconds spent on the request
    pub time_consuming: f32,
    pub err: Option<String>,
}

/// a sample as kept in the store, with its insertion id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: u64,
    #[serde(flatten)]
    pub sample: T,
}
