//! sled backed history of sensor and weather samples.
//!
//! keys are `generate_id()` in big endian so iteration order is insertion
//! order, values are json.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{SensorSample, Stored, WeatherSample};

const SENSOR_TREE: &str = "sensor_samples";
const WEATHER_TREE: &str = "weather_samples";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("could not (de)serialize sample: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt key of {0} bytes")]
    CorruptKey(usize),
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    sensor: sled::Tree,
    weather: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            sensor: db.open_tree(SENSOR_TREE)?,
            weather: db.open_tree(WEATHER_TREE)?,
            db,
        })
    }

    pub fn insert_sensor(&self, sample: &SensorSample) -> Result<u64, StoreError> {
        self.insert(&self.sensor, sample)
    }

    pub fn insert_weather(&self, sample: &WeatherSample) -> Result<u64, StoreError> {
        self.insert(&self.weather, sample)
    }

    /// Newest first.
    pub fn recent_sensor(&self, limit: usize) -> Result<Vec<Stored<SensorSample>>, StoreError> {
        recent(&self.sensor, limit)
    }

    /// Newest first.
    pub fn recent_weather(&self, limit: usize) -> Result<Vec<Stored<WeatherSample>>, StoreError> {
        recent(&self.weather, limit)
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn insert<T: Serialize>(&self, tree: &sled::Tree, sample: &T) -> Result<u64, StoreError> {
        let id = self.db.generate_id()?;
        let value = serde_json::to_vec(sample)?;
        tree.insert(id.to_be_bytes(), value)?;
        Ok(id)
    }
}

fn recent<T: DeserializeOwned>(tree: &sled::Tree, limit: usize) -> Result<Vec<Stored<T>>, StoreError> {
    tree.iter()
        .rev()
        .take(limit)
        .map(|entry| {
            let (key, value) = entry?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::CorruptKey(key.len()))?;
            Ok(Stored {
                id: u64::from_be_bytes(key),
                sample: serde_json::from_slice(&value)?,
            })
        })
        .collect()
}
