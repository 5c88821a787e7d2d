use crate::config::Config;
use crate::models::{numeric_suffix, Telemetry, Vehicle};
use crate::mqtt_service::{ListenerHandle, MqttService};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("field '{0}' is missing")]
    Missing(&'static str),
    #[error("field '{0}' is not numeric")]
    NotNumeric(&'static str),
}

/// Accepts JSON numbers and numeric strings. NaN and infinities are rejected.
fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn coordinate(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<f64, TelemetryError> {
    let value = object.get(field).ok_or(TelemetryError::Missing(field))?;
    numeric(value).ok_or(TelemetryError::NotNumeric(field))
}

/// Normalizes a raw telemetry payload.
///
/// Latitude and longitude must both be present and numeric. Temperature is
/// optional: an absent, null or non-numeric value leaves it unset.
pub fn parse_payload(payload: &[u8]) -> Result<Telemetry, TelemetryError> {
    let data: Value = serde_json::from_slice(payload)?;
    let object = data.as_object().ok_or(TelemetryError::NotAnObject)?;

    let latitude = coordinate(object, "latitude")?;
    let longitude = coordinate(object, "longitude")?;

    let temperature = match object.get("temperature") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let parsed = numeric(value);
            if parsed.is_none() {
                debug!("Ignoring non-numeric temperature {}", value);
            }
            parsed
        }
    };

    Ok(Telemetry {
        latitude,
        longitude,
        temperature,
    })
}

/// Attaches per-vehicle telemetry listeners to the shared broker connection.
pub struct TelemetrySubscriber {
    service: Arc<MqttService>,
    topic_prefix: String,
    log_malformed: bool,
}

impl TelemetrySubscriber {
    pub fn new(service: Arc<MqttService>, config: &Config) -> Self {
        Self {
            service,
            topic_prefix: config.telemetry_topic_prefix.clone(),
            log_malformed: config.log_malformed_telemetry,
        }
    }

    /// The vehicle's explicit topic, else one derived from its identifier.
    pub fn topic_for(&self, vehicle: &Vehicle) -> String {
        if let Some(topic) = &vehicle.topic {
            return topic.clone();
        }
        match numeric_suffix(&vehicle.id) {
            Some(n) => format!("{}/{}", self.topic_prefix, n),
            None => format!("{}/{}", self.topic_prefix, vehicle.id),
        }
    }

    /// Delivers valid telemetry for `vehicle` to `on_update` until the handle is detached.
    ///
    /// Custom vehicles are display-only and get a no-op handle. Malformed
    /// payloads are dropped here and never reach `on_update`.
    pub fn subscribe<F>(&self, vehicle: &Vehicle, on_update: F) -> ListenerHandle
    where
        F: Fn(Telemetry) + Send + Sync + 'static,
    {
        if vehicle.is_custom {
            return ListenerHandle::noop();
        }

        let topic = self.topic_for(vehicle);
        self.service.ensure_subscribed(&topic);

        let log_malformed = self.log_malformed;
        self.service
            .add_listener(Arc::new(move |received_topic: &str, payload: &[u8]| {
                if received_topic != topic {
                    return;
                }

                match parse_payload(payload) {
                    Ok(telemetry) => {
                        debug!("Received telemetry on {}: {:?}", received_topic, telemetry);
                        on_update(telemetry);
                    }
                    Err(e) if log_malformed => {
                        warn!("Dropping telemetry on {}: {}", received_topic, e);
                    }
                    Err(e) => {
                        debug!("Dropping telemetry on {}: {}", received_topic, e);
                    }
                }
            }))
    }
}
