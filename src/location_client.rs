use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("HTTP error! status: {0}")]
    Status(StatusCode),
    #[error("No location data available")]
    NoData,
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Fetches last-known locations from the location HTTP API.
#[derive(Debug, Clone)]
pub struct LocationClient {
    http: Client,
    base_url: String,
}

/// Empty-ish JSON bodies that mean "nothing known yet".
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

impl LocationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LocationError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn latest_url(&self, vehicle_id: &str) -> String {
        format!("{}/location/latest/{}", self.base_url, vehicle_id)
    }

    /// `GET {base}/location/latest/{vehicleId}`.
    pub async fn latest(&self, vehicle_id: &str) -> Result<Value, LocationError> {
        let url = self.latest_url(vehicle_id);
        debug!("Fetching latest location from {}", url);

        let result: Result<Value, LocationError> = async {
            let response = self.http.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(LocationError::Status(response.status()));
            }

            let body = response.bytes().await?;
            if body.iter().all(u8::is_ascii_whitespace) {
                return Err(LocationError::NoData);
            }
            let data: Value = serde_json::from_slice(&body).map_err(|_| LocationError::NoData)?;
            if is_falsy(&data) {
                return Err(LocationError::NoData);
            }
            Ok(data)
        }
        .await;

        if let Err(e) = &result {
            error!("Error fetching latest location: {}", e);
        }
        result
    }
}
