//! ==============================================================================
//! api.rs - json http api
//! ==============================================================================
//!
//! routes:
//!     GET /ping                                        liveness
//!     GET /api/v1/current_environmental_sampling_data  fresh (or cached) sample
//!     GET /api/v1/environmental_sampling_data?limit=N  stored sensor history
//!     GET /api/v1/weather_sampling_data?limit=N        stored weather history
//!
//! relationships:
//!     - used by: main.rs (serves the router)
//!     - uses: station.rs
//!
//! ==============================================================================

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::hal::I2cBus;
use crate::station::Station;
use crate::store::StoreError;

const DEFAULT_LIMIT: usize = 60;
const MAX_LIMIT: usize = 1000;

pub fn router<B: I2cBus + 'static>(station: Station<B>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/api/v1/current_environmental_sampling_data",
            get(current_handler::<B>),
        )
        .route(
            "/api/v1/environmental_sampling_data",
            get(sensor_history_handler::<B>),
        )
        .route("/api/v1/weather_sampling_data", get(weather_history_handler::<B>))
        .layer(CorsLayer::permissive())
        .with_state(station)
}

pub async fn serve<B: I2cBus + 'static>(
    bind: &str,
    station: Station<B>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("[HTTP] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(station))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn ping() -> Json<Value> {
    let res = json!({"status": StatusCode::OK.as_u16(), "time": now(), "message": "pong"});
    tracing::debug!("{}", res);
    Json(res)
}

async fn current_handler<B: I2cBus + 'static>(State(station): State<Station<B>>) -> Json<Value> {
    let sensor = station.sample_now().await.into_sample();
    Json(json!({
        "status": StatusCode::OK.as_u16(),
        "time": now(),
        "sensor_sampling": sensor,
        "weather_sampling": station.last_weather(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

impl HistoryParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

async fn sensor_history_handler<B: I2cBus + 'static>(
    State(station): State<Station<B>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    history(station.store().map(|s| s.recent_sensor(params.limit())))
}

async fn weather_history_handler<B: I2cBus + 'static>(
    State(station): State<Station<B>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    history(station.store().map(|s| s.recent_weather(params.limit())))
}

fn history<T: serde::Serialize>(res: Option<Result<Vec<T>, StoreError>>) -> Response {
    match res {
        Some(Ok(samples)) => Json(json!({
            "status": StatusCode::OK.as_u16(),
            "time": now(),
            "data": samples,
        }))
        .into_response(),
        Some(Err(e)) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        None => error(StatusCode::SERVICE_UNAVAILABLE, "storage disabled"),
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    tracing::warn!("[HTTP] {}: {}", status, message);
    (
        status,
        Json(json!({"status": status.as_u16(), "message": message})),
    )
        .into_response()
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorsConfig;
    use crate::domain::SensorSample;
    use crate::hal::MockBus;
    use crate::sampler::tests::queue_cycle;
    use crate::sampler::Sampler;
    use crate::store::Store;
    use std::sync::Arc;

    fn station(with_store: bool) -> (Arc<MockBus>, Station<MockBus>) {
        let bus = Arc::new(MockBus::new());
        let sampler = Sampler::new(bus.clone(), &SensorsConfig::default());
        let store = with_store
            .then(|| Store::from_db(sled::Config::new().temporary(true).open().unwrap()).unwrap());
        (bus, Station::new(sampler, store, CancellationToken::new()))
    }

    #[tokio::test]
    async fn ping_pongs() {
        let Json(body) = ping().await;
        assert_eq!(body["status"], 200);
        assert_eq!(body["message"], "pong");
        assert!(chrono::DateTime::parse_from_rfc3339(body["time"].as_str().unwrap()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn current_has_sensor_and_weather_parts() {
        let (bus, station) = station(false);
        queue_cycle(&bus, true);

        let Json(body) = current_handler(State(station)).await;
        assert_eq!(body["status"], 200);
        assert!(body["sensor_sampling"]["humidity"].is_number());
        assert!(body["sensor_sampling"]["aht20_err"].is_null());
        assert!(body["weather_sampling"].is_null());
    }

    #[tokio::test]
    async fn sensor_history_answers_ok() {
        let (_bus, station) = station(true);
        let store = station.store().unwrap();
        for _ in 0..5 {
            store
                .insert_sensor(&SensorSample {
                    time: Utc::now(),
                    ..Default::default()
                })
                .unwrap();
        }

        let res = sensor_history_handler(
            State(station.clone()),
            Query(HistoryParams { limit: Some(3) }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn history_without_store_is_unavailable() {
        let (_bus, station) = station(false);
        let res = weather_history_handler(State(station), Query(HistoryParams { limit: None })).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn limit_is_capped() {
        assert_eq!(HistoryParams { limit: None }.limit(), DEFAULT_LIMIT);
        assert_eq!(HistoryParams { limit: Some(10_000) }.limit(), MAX_LIMIT);
    }
}
