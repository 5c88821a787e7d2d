use crate::fleet::Fleet;
use crate::mqtt_service::{ListenerHandle, MqttService};
use crate::telemetry::TelemetrySubscriber;
use std::sync::Arc;
use tracing::{info, Level};

/// Initialize logging. `log` records from dependencies are forwarded too.
pub fn start_logging(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// The one-time telemetry wiring for every vehicle known at start-up.
pub fn start_telemetry(
    fleet: &Arc<Fleet>,
    mqtt_service: &MqttService,
    subscriber: &TelemetrySubscriber,
) -> Vec<ListenerHandle> {
    let handles = fleet.start_telemetry(subscriber);
    info!(
        "Telemetry wired: {} listener(s) on the shared broker connection.",
        mqtt_service.listener_count()
    );
    handles
}

/// Detach listeners and close the broker connection.
pub async fn handle_shutdown(mqtt_service: Arc<MqttService>, handles: Vec<ListenerHandle>) {
    info!("Dashboard is shutting down...");
    for handle in handles {
        handle.detach();
    }
    mqtt_service.disconnect().await;
}
