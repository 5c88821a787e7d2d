use crate::config::{Config, PublishMode};
use crate::models::numeric_suffix;
use crate::mqtt_service::{BrokerError, MqttService};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("vehicle '{0}' has no numeric suffix to derive a control topic from")]
    UnroutableVehicle(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish command: {0}")]
    Broker(#[from] BrokerError),
}

/// Wire form of an on/off command: `{"action": 1}` or `{"action": 0}`.
#[derive(Debug, Serialize)]
struct StatusCommand {
    action: u8,
}

/// Sends engine on/off commands to per-vehicle control topics.
///
/// In [`PublishMode::Detached`] delivery is at-most-once and unconfirmed: the
/// caller gets `Ok(true)` before the send happens and transport failures are
/// only logged.
pub struct StatusPublisher {
    service: Arc<MqttService>,
    topic_prefix: String,
    mode: PublishMode,
}

impl StatusPublisher {
    pub fn new(service: Arc<MqttService>, config: &Config) -> Self {
        Self {
            service,
            topic_prefix: config.control_topic_prefix.clone(),
            mode: config.publish_mode,
        }
    }

    /// `vehicle-7` maps to `{prefix}/7`.
    pub fn control_topic(&self, vehicle_id: &str) -> Result<String, CommandError> {
        let n = numeric_suffix(vehicle_id)
            .ok_or_else(|| CommandError::UnroutableVehicle(vehicle_id.to_string()))?;
        Ok(format!("{}/{}", self.topic_prefix, n))
    }

    pub async fn publish(&self, vehicle_id: &str, is_on: bool) -> Result<bool, CommandError> {
        let topic = self.control_topic(vehicle_id)?;
        let payload = serde_json::to_vec(&StatusCommand {
            action: u8::from(is_on),
        })?;

        info!(
            "Publishing to topic {}: {}",
            topic,
            String::from_utf8_lossy(&payload)
        );

        let client = self.service.client();
        match self.mode {
            PublishMode::Detached => {
                tokio::spawn(async move {
                    match client.publish(topic.clone(), payload).await {
                        Ok(()) => info!("Successfully published to {}", topic),
                        Err(e) => error!("Error publishing to {}: {}", topic, e),
                    }
                });
            }
            PublishMode::Confirmed => {
                client.publish(topic.clone(), payload).await?;
                info!("Successfully published to {}", topic);
            }
        }

        Ok(true)
    }
}
