//! Remote realtime weather api.
//!
//! The body is kept as the raw json string, the station does not interpret
//! it. A failed request still yields a sample carrying the error.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::WeatherConfig;
use crate::domain::WeatherSample;

#[derive(Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    url: String,
}

impl WeatherClient {
    pub fn new(config: &WeatherConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            url: realtime_url(config),
        })
    }

    pub async fn fetch(&self) -> WeatherSample {
        let started = Instant::now();
        let time = Utc::now();
        let res = self.request().await;
        let time_consuming = started.elapsed().as_secs_f32();

        match res {
            Ok(body) => WeatherSample {
                time,
                response: Some(body),
                time_consuming,
                err: None,
            },
            Err(e) => {
                tracing::warn!("[WEATHER] ⚠ Request failed: {}", e);
                WeatherSample {
                    time,
                    response: None,
                    time_consuming,
                    err: Some(e.to_string()),
                }
            }
        }
    }

    async fn request(&self) -> reqwest::Result<String> {
        self.http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

fn realtime_url(config: &WeatherConfig) -> String {
    format!(
        "{}/{}/{},{}/realtime.json",
        config.endpoint.trim_end_matches('/'),
        config.token,
        config.longitude,
        config.latitude
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_layout() {
        let config = WeatherConfig {
            endpoint: "https://api.example.com/v2.5/".to_string(),
            token: "TOKEN".to_string(),
            longitude: 117.559364,
            latitude: 39.764,
            ..Default::default()
        };
        assert_eq!(
            realtime_url(&config),
            "https://api.example.com/v2.5/TOKEN/117.559364,39.764/realtime.json"
        );
    }

    #[tokio::test]
    async fn unreachable_api_becomes_error_sample() {
        // nothing listens on the discard port of localhost
        let config = WeatherConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            ..Default::default()
        };
        let client = WeatherClient::new(&config).unwrap();

        let sample = client.fetch().await;
        assert!(sample.response.is_none());
        assert!(sample.err.is_some());
        assert!(sample.time_consuming >= 0.0);
    }
}
