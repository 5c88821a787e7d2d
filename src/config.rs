use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use uuid::Uuid;

use crate::geofence::Geofence;

/// How the broker connection reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Ws,
    Wss,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "ws" => Ok(TransportKind::Ws),
            "wss" => Ok(TransportKind::Wss),
            other => Err(ConfigError::ParsingError(format!(
                "MQTT_TRANSPORT must be one of tcp, ws, wss (got '{}')",
                other
            ))),
        }
    }
}

/// Whether a status command is confirmed before the caller sees the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// At-most-once, unconfirmed delivery. The caller is told "sent" right away.
    Detached,
    /// The caller waits for the client to accept the publish.
    Confirmed,
}

impl FromStr for PublishMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detached" => Ok(PublishMode::Detached),
            "confirmed" => Ok(PublishMode::Confirmed),
            other => Err(ConfigError::ParsingError(format!(
                "COMMAND_PUBLISH_MODE must be 'detached' or 'confirmed' (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub ws_path: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub max_retries: i32,
    pub retry_interval_ms: u64,
}

impl BrokerConfig {
    /// Address handed to rumqttc. Websocket transports take a full URL.
    pub fn broker_addr(&self) -> String {
        match self.transport {
            TransportKind::Tcp => self.host.clone(),
            TransportKind::Ws => format!("ws://{}:{}{}", self.host, self.port, self.ws_path),
            TransportKind::Wss => format!("wss://{}:{}{}", self.host, self.port, self.ws_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,

    pub telemetry_topic_prefix: String,
    pub control_topic_prefix: String,
    pub log_malformed_telemetry: bool,
    pub publish_mode: PublishMode,

    pub location_api_base_url: String,
    pub location_api_timeout_ms: u64,

    pub api_address: String,
    pub api_port: u16,

    pub geofence: Option<Geofence>,
    pub log_level: Level,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError> {
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value", key)))
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.broker.retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.location_api_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "LOCATION_API_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let trim_prefix = |topic: String| topic.trim_end_matches('/').to_string();

        let ws_path = lookup("MQTT_WS_PATH").unwrap_or_else(|| "/mqtt".to_string());
        let ws_path = if ws_path.starts_with('/') {
            ws_path
        } else {
            format!("/{}", ws_path)
        };

        let broker = BrokerConfig {
            host: lookup("MQTT_HOST").unwrap_or_else(|| "broker.hivemq.com".to_string()),
            port: parse_var(&lookup, "MQTT_PORT", "8884")?,
            transport: parse_var(&lookup, "MQTT_TRANSPORT", "wss")?,
            ws_path,
            username: lookup("MQTT_USERNAME").unwrap_or_default(),
            password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            client_id: lookup("MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("fleet_dashboard_{}", Uuid::new_v4())),
            keep_alive_secs: parse_var(&lookup, "MQTT_KEEP_ALIVE_SECS", "30")?,
            max_retries: parse_var(&lookup, "MQTT_MAX_RETRIES", "-1")?,
            retry_interval_ms: parse_var(&lookup, "MQTT_RETRY_INTERVAL_MS", "5000")?,
        };

        if broker.host.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_HOST".to_string()));
        }

        let geofence = match (
            lookup("GEOFENCE_LATITUDE"),
            lookup("GEOFENCE_LONGITUDE"),
            lookup("GEOFENCE_RADIUS_M"),
        ) {
            (None, None, None) => None,
            (Some(_), Some(_), Some(_)) => {
                let fence = Geofence {
                    latitude: parse_var(&lookup, "GEOFENCE_LATITUDE", "")?,
                    longitude: parse_var(&lookup, "GEOFENCE_LONGITUDE", "")?,
                    radius_m: parse_var(&lookup, "GEOFENCE_RADIUS_M", "")?,
                };
                if !fence.is_valid() {
                    return Err(ConfigError::ParsingError(
                        "GEOFENCE_* must be finite and the radius positive".to_string(),
                    ));
                }
                Some(fence)
            }
            _ => {
                return Err(ConfigError::MissingOrInvalid(
                    "GEOFENCE_LATITUDE/GEOFENCE_LONGITUDE/GEOFENCE_RADIUS_M".to_string(),
                ))
            }
        };

        let config = Self {
            broker,

            telemetry_topic_prefix: trim_prefix(
                lookup("TELEMETRY_TOPIC_PREFIX").unwrap_or_else(|| "GPS/location".to_string()),
            ),
            control_topic_prefix: trim_prefix(
                lookup("CONTROL_TOPIC_PREFIX").unwrap_or_else(|| "location".to_string()),
            ),
            log_malformed_telemetry: parse_var(&lookup, "TELEMETRY_LOG_MALFORMED", "true")?,
            publish_mode: parse_var(&lookup, "COMMAND_PUBLISH_MODE", "detached")?,

            location_api_base_url: lookup("LOCATION_API_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3001/api".to_string())
                .trim_end_matches('/')
                .to_string(),
            location_api_timeout_ms: parse_var(&lookup, "LOCATION_API_TIMEOUT_MS", "10000")?,

            api_address: lookup("API_ADDRESS").unwrap_or_else(|| "127.0.0.1".to_string()),
            api_port: parse_var(&lookup, "API_PORT", "8000")?,

            geofence,
            log_level: parse_var(&lookup, "LOG_LEVEL", "info")?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "MQTT_CLIENT_ID" => Some("test_client".to_string()),
        _ => None,
    })
    .expect("defaults are valid")
}
