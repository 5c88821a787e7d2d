mod alert_log;
mod config;
mod fleet;
mod geofence;
mod location_client;
mod models;
mod mqtt_service;
mod rest_server;
mod service_utils;
mod status_publisher;
mod subscription_registry;
mod telemetry;
mod vehicle_store;

use crate::config::Config;
use crate::fleet::Fleet;
use crate::location_client::LocationClient;
use crate::mqtt_service::MqttService;
use crate::rest_server::run_rest_server;
use crate::service_utils::{handle_shutdown, start_logging, start_telemetry};
use crate::status_publisher::StatusPublisher;
use crate::telemetry::TelemetrySubscriber;
use crate::vehicle_store::VehicleStore;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not up yet; fall back to the default level.
            start_logging(tracing::Level::INFO);
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    start_logging(config.log_level);

    let locations = match LocationClient::new(
        &config.location_api_base_url,
        Duration::from_millis(config.location_api_timeout_ms),
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create location client: {:?}", e);
            return;
        }
    };

    // One broker connection for the whole process; it connects on first use.
    let mqtt_service = MqttService::new(config.broker.clone());

    let fleet = Fleet::new(
        VehicleStore::with_builtin_fleet(&config.telemetry_topic_prefix),
        StatusPublisher::new(mqtt_service.clone(), &config),
        config.geofence,
    );
    let subscriber = TelemetrySubscriber::new(mqtt_service.clone(), &config);

    let handles = start_telemetry(&fleet, &mqtt_service, &subscriber);

    info!(
        "Serving dashboard API on {}:{}",
        config.api_address, config.api_port
    );
    if let Err(e) = run_rest_server(fleet, locations, &config).await {
        error!("REST API failed: {:?}", e);
    }

    handle_shutdown(mqtt_service, handles).await;
    info!("All services shut down successfully.");
}
