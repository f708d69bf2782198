//! ==============================================================================
//! main.rs - weather station daemon entry point
//! ==============================================================================
//!
//! purpose:
//!     samples the i2c environment sensors on a fixed interval, keeps a
//!     history of the samples and serves them over a small json api.
//!
//! responsibilities:
//!     - load configuration and set up logging
//!     - open the i2c bus (rppal on a pi, an in-memory bus otherwise)
//!     - run the sensor sampling loop and the remote weather loop
//!     - serve the http api
//!     - shut everything down cleanly on ctrl-c
//!
//! relationships:
//!     - uses: config.rs, station.rs, api.rs, weather.rs, store.rs
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                      daemon (this file)                      │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//!     │  │ sensor loop  │  │ weather loop │  │ http api (api.rs)  │  │
//!     │  └──────┬───────┘  └──────┬───────┘  └─────────┬──────────┘  │
//!     │         └─────────────────┼────────────────────┘             │
//!     │                     ┌─────┴─────┐                            │
//!     │                     │  station  │ <- station.rs              │
//!     │                     └─────┬─────┘                            │
//!     │              ┌────────────┴────────────┐                     │
//!     │        ┌─────┴─────┐             ┌─────┴─────┐               │
//!     │        │  sampler  │             │   store   │ (sled)        │
//!     │        └─────┬─────┘             └───────────┘               │
//!     └──────────────┼───────────────────────────────────────────────┘
//!                    │ i2c
//!          ┌─────────┼─────────┐
//!          ▼         ▼         ▼
//!       aht20     bmp280    bh1750
//!
//! ==============================================================================

mod api;
mod config;
mod domain;
mod drivers;
mod hal;
mod sampler;
mod station;
mod store;
mod weather;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::StationConfig;
use crate::domain::SensorSample;
use crate::hal::I2cBus;
use crate::sampler::Sampler;
use crate::station::Station;
use crate::store::Store;
use crate::weather::WeatherClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = StationConfig::load_or_default()?;
    setup_tracing(&config.logging.level)?;

    info!("===========================================================");
    info!("  Weather Station");
    info!("===========================================================");
    config.log_summary();

    #[cfg(feature = "hardware")]
    let bus = Arc::new(hal::RppalBus::open(config.i2c.bus)?);
    #[cfg(not(feature = "hardware"))]
    let bus = Arc::new(hal::MockBus::new());

    run(config, bus).await
}

fn setup_tracing(default_level: &str) -> Result<()> {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::builder()
            .parse(default_level)
            .with_context(|| format!("invalid log level {default_level:?}"))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
    Ok(())
}

async fn run<B: I2cBus + 'static>(config: StationConfig, bus: Arc<B>) -> Result<()> {
    let store = Store::open(&config.storage.path).with_context(|| {
        format!("could not open database at {}", config.storage.path.display())
    })?;
    info!("[STARTUP] ✓ Database at {}", config.storage.path.display());

    let cancel = CancellationToken::new();
    let sampler = Sampler::new(bus, &config.sensors);
    let station = Station::new(sampler, Some(store.clone()), cancel.clone());

    let server = tokio::spawn({
        let station = station.clone();
        let cancel = cancel.clone();
        let bind = config.http.bind.clone();
        async move {
            if let Err(e) = api::serve(&bind, station, cancel.clone()).await {
                error!("[ERROR] Web server error: {:#}", e);
                cancel.cancel();
            }
        }
    });

    let sensors = tokio::spawn(sensor_loop(
        station.clone(),
        Duration::from_secs(config.polling.sensor_interval_seconds),
        config.logging.show_sensor_data,
        cancel.clone(),
    ));

    let weather = if config.weather.enabled {
        let client = WeatherClient::new(&config.weather)?;
        Some(tokio::spawn(weather_loop(
            station.clone(),
            client,
            Duration::from_secs(config.weather.interval_seconds),
            cancel.clone(),
        )))
    } else {
        info!("[WEATHER] Disabled");
        None
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("could not listen for ctrl-c")?;
            info!("[SHUTDOWN] Ctrl-C received, stopping");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    reap("sensor loop", sensors).await;
    if let Some(weather) = weather {
        reap("weather loop", weather).await;
    }
    reap("web server", server).await;

    store.flush().await.context("could not flush database")?;
    info!("[SHUTDOWN] ✓ Done");
    Ok(())
}

/// Waits for a background task, reporting it if it panicked.
async fn reap(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            error!("[ERROR] {} stopped abnormally: {}", name, e);
            false
        }
    }
}

// ==============================================================================
// scheduler loops
// ==============================================================================

async fn sensor_loop<B: I2cBus + 'static>(
    station: Station<B>,
    period: Duration,
    show_data: bool,
    cancel: CancellationToken,
) {
    info!("[RUNTIME] Starting sensor sampling ({}s interval)", period.as_secs());
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match station.sample_and_store().await {
            Some(sample) if show_data => info!("{}", describe(&sample)),
            Some(_) => {}
            None => warn!("[RUNTIME] ⚠ Sampling cycle produced no sample"),
        }
    }
}

async fn weather_loop<B: I2cBus + 'static>(
    station: Station<B>,
    client: WeatherClient,
    period: Duration,
    cancel: CancellationToken,
) {
    info!("[WEATHER] Fetching every {}s", period.as_secs());
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let sample = tokio::select! {
            _ = cancel.cancelled() => break,
            sample = client.fetch() => sample,
        };
        if sample.err.is_none() {
            info!("[WEATHER] ✓ Realtime weather in {:.3}s", sample.time_consuming);
        }
        station.record_weather(sample);
    }
}

fn describe(sample: &SensorSample) -> String {
    fn field(value: Option<f32>, unit: &str) -> String {
        match value {
            Some(v) => format!("{v:.2}{unit}"),
            None => "n/a".to_string(),
        }
    }

    format!(
        "Temperature = {}, AHT20-Temperature = {}, Humidity = {}, Pressure = {}, Altitude = {}, Illuminance = {}, Time-consuming = {:.3}s",
        field(sample.temperature, "°C"),
        field(sample.aht20_temperature, "°C"),
        field(sample.humidity, "%"),
        field(sample.pressure, "Pa"),
        field(sample.altitude, "m"),
        field(sample.illuminance, "lux"),
        sample.time_consuming,
    )
}
