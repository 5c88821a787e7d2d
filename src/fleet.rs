use crate::alert_log::AlertLog;
use crate::geofence::{Geofence, GeofenceMonitor};
use crate::models::{Alert, Telemetry, Vehicle};
use crate::mqtt_service::ListenerHandle;
use crate::status_publisher::{CommandError, StatusPublisher};
use crate::telemetry::TelemetrySubscriber;
use crate::vehicle_store::{StoreError, VehicleStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Dashboard state: vehicles, alerts and the actions that change them.
pub struct Fleet {
    vehicles: VehicleStore,
    alerts: AlertLog,
    geofence: Option<GeofenceMonitor>,
    publisher: StatusPublisher,
    engine_commands: Mutex<()>,
    telemetry_started: AtomicBool,
}

impl Fleet {
    pub fn new(
        vehicles: VehicleStore,
        publisher: StatusPublisher,
        geofence: Option<Geofence>,
    ) -> Arc<Self> {
        Arc::new(Self {
            vehicles,
            alerts: AlertLog::new(),
            geofence: geofence.map(GeofenceMonitor::new),
            publisher,
            engine_commands: Mutex::new(()),
            telemetry_started: AtomicBool::new(false),
        })
    }

    pub fn vehicles(&self) -> &VehicleStore {
        &self.vehicles
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Wires telemetry for every non-custom vehicle known right now.
    ///
    /// Runs once; later calls attach nothing, and vehicles added afterwards are
    /// never wired.
    pub fn start_telemetry(self: &Arc<Self>, subscriber: &TelemetrySubscriber) -> Vec<ListenerHandle> {
        if self.telemetry_started.swap(true, Ordering::SeqCst) {
            debug!("Telemetry already started, skipping.");
            return Vec::new();
        }

        let handles: Vec<ListenerHandle> = self
            .vehicles
            .list()
            .iter()
            .filter(|vehicle| !vehicle.is_custom)
            .map(|vehicle| {
                let fleet = Arc::downgrade(self);
                let vehicle_id = vehicle.id.clone();
                subscriber.subscribe(vehicle, move |telemetry| {
                    if let Some(fleet) = fleet.upgrade() {
                        fleet.handle_telemetry(&vehicle_id, telemetry);
                    }
                })
            })
            .collect();

        info!("Attached telemetry listeners for {} vehicles.", handles.len());
        handles
    }

    pub fn handle_telemetry(&self, vehicle_id: &str, telemetry: Telemetry) {
        let Some(vehicle) = self.vehicles.apply_telemetry(vehicle_id, telemetry) else {
            return;
        };

        if let Some(monitor) = &self.geofence {
            if let Some(is_outside) =
                monitor.observe(&vehicle.id, telemetry.latitude, telemetry.longitude)
            {
                self.alerts.raise(&vehicle.id, &vehicle.name, is_outside);
            }
        }
    }

    /// Records a crossing detected elsewhere (e.g. by the map view).
    pub fn report_geofence(&self, vehicle_id: &str, is_outside: bool) -> Option<Alert> {
        let vehicle = self.vehicles.get(vehicle_id)?;
        Some(self.alerts.raise(&vehicle.id, &vehicle.name, is_outside))
    }

    /// Flips the engine flag and sends the new state to non-custom vehicles.
    ///
    /// Toggles run one at a time, so the command sent always matches the flag
    /// that is stored afterwards.
    pub async fn toggle_engine(&self, vehicle_id: &str) -> Result<Vehicle, FleetError> {
        let _serialized = self.engine_commands.lock().await;

        let current = self
            .vehicles
            .get(vehicle_id)
            .ok_or_else(|| StoreError::UnknownVehicle(vehicle_id.to_string()))?;

        if !current.is_custom {
            self.publisher.publish(vehicle_id, !current.is_on).await?;
        }

        Ok(self.vehicles.toggle_engine(vehicle_id)?)
    }

    pub fn toggle_door_lock(&self, vehicle_id: &str) -> Result<Vehicle, FleetError> {
        Ok(self.vehicles.toggle_door_lock(vehicle_id)?)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{harness, harness_with};
    use super::*;
    use crate::config::{test_config, PublishMode};
    use crate::models::{NewVehicle, Severity};
    use crate::mqtt_service::testing::publish_event;
    use tokio::time::{sleep, Duration};

    fn fence() -> Geofence {
        Geofence {
            latitude: 10.0,
            longitude: 10.0,
            radius_m: 1_000.0,
        }
    }

    #[tokio::test]
    async fn telemetry_is_wired_once() {
        let h = harness(None);

        let handles = h.fleet.start_telemetry(&h.subscriber);
        assert_eq!(handles.len(), 2);
        assert!(h.fleet.start_telemetry(&h.subscriber).is_empty());

        assert_eq!(
            h.fake.subscribe_requests(),
            vec!["GPS/location/1".to_string(), "GPS/location/2".to_string()]
        );
        assert_eq!(h.service.listener_count(), 2);
    }

    #[tokio::test]
    async fn incoming_telemetry_updates_the_addressed_vehicle() {
        let h = harness(None);
        let _handles = h.fleet.start_telemetry(&h.subscriber);

        h.service.handle_event(publish_event(
            "GPS/location/2",
            r#"{"latitude": "12.34", "longitude": "56.78", "temperature": "30"}"#,
        ));

        let second = h.fleet.vehicles().get("vehicle-2").unwrap();
        assert_eq!(second.latitude, Some(12.34));
        assert_eq!(second.longitude, Some(56.78));
        assert_eq!(second.temperature, 30.0);

        let first = h.fleet.vehicles().get("vehicle-1").unwrap();
        assert_eq!(first.latitude, None);
        assert_eq!(first.temperature, 25.0);
    }

    #[tokio::test]
    async fn vehicles_added_later_are_not_wired() {
        let h = harness(None);
        let _handles = h.fleet.start_telemetry(&h.subscriber);

        let custom = h.fleet.vehicles().add_vehicle(NewVehicle {
            vehicle_number: 9,
            latitude: 1.0,
            longitude: 2.0,
        });
        h.service.handle_event(publish_event(
            "GPS/location/3",
            r#"{"latitude": 50, "longitude": 50}"#,
        ));

        assert_eq!(h.fleet.vehicles().get(&custom.id).unwrap().latitude, Some(1.0));
        assert_eq!(h.fake.subscribe_requests().len(), 2);
    }

    #[tokio::test]
    async fn geofence_crossings_raise_alerts() {
        let h = harness(Some(fence()));
        let _handles = h.fleet.start_telemetry(&h.subscriber);

        h.service.handle_event(publish_event(
            "GPS/location/1",
            r#"{"latitude": 10.0, "longitude": 10.0}"#,
        ));
        assert!(h.fleet.alerts().list().is_empty());

        h.service.handle_event(publish_event(
            "GPS/location/1",
            r#"{"latitude": 11.0, "longitude": 10.0}"#,
        ));
        h.service.handle_event(publish_event(
            "GPS/location/1",
            r#"{"latitude": 10.0, "longitude": 10.0}"#,
        ));

        let alerts = h.fleet.alerts().list();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Info);
        assert_eq!(alerts[1].severity, Severity::Warning);
        assert_eq!(alerts[1].message, "Vehicle 1 has left its designated area");
    }

    #[tokio::test]
    async fn reported_crossings_need_a_known_vehicle() {
        let h = harness(None);

        let alert = h.fleet.report_geofence("vehicle-2", true).unwrap();
        assert_eq!(alert.vehicle_id, "vehicle-2");
        assert!(h.fleet.report_geofence("vehicle-42", true).is_none());
        assert_eq!(h.fleet.alerts().list().len(), 1);
    }

    #[tokio::test]
    async fn engine_toggle_publishes_new_state() {
        let h = harness(None);

        let vehicle = h.fleet.toggle_engine("vehicle-1").await.unwrap();
        assert!(vehicle.is_on);

        for _ in 0..100 {
            if !h.fake.published().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            h.fake.published(),
            vec![("location/1".to_string(), br#"{"action":1}"#.to_vec())]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_engine_toggles_send_matching_commands() {
        let mut config = test_config();
        config.publish_mode = PublishMode::Confirmed;
        let h = harness_with(config, None);
        h.fake.publish_delay_ms.store(50, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            h.fleet.toggle_engine("vehicle-1"),
            h.fleet.toggle_engine("vehicle-1")
        );
        let mut states = vec![first.unwrap().is_on, second.unwrap().is_on];
        states.sort();
        assert_eq!(states, vec![false, true]);

        assert!(!h.fleet.vehicles().get("vehicle-1").unwrap().is_on);
        let commands: Vec<Vec<u8>> = h.fake.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            commands,
            vec![br#"{"action":1}"#.to_vec(), br#"{"action":0}"#.to_vec()]
        );
    }

    #[tokio::test]
    async fn failed_confirmed_toggle_keeps_engine_state() {
        let mut config = test_config();
        config.publish_mode = PublishMode::Confirmed;
        let h = harness_with(config, None);
        h.fake.fail_publish.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.fleet.toggle_engine("vehicle-1").await,
            Err(FleetError::Command(CommandError::Broker(_)))
        ));
        assert!(!h.fleet.vehicles().get("vehicle-1").unwrap().is_on);
    }

    #[tokio::test]
    async fn custom_vehicle_toggle_stays_local() {
        let h = harness(None);
        let custom = h.fleet.vehicles().add_vehicle(NewVehicle {
            vehicle_number: 9,
            latitude: 1.0,
            longitude: 2.0,
        });

        assert!(h.fleet.toggle_engine(&custom.id).await.unwrap().is_on);
        sleep(Duration::from_millis(20)).await;
        assert!(h.fake.published().is_empty());

        assert!(matches!(
            h.fleet.toggle_engine("vehicle-42").await,
            Err(FleetError::Store(_))
        ));
    }
}
