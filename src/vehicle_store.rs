use crate::models::{NewVehicle, Telemetry, Vehicle};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown vehicle '{0}'")]
    UnknownVehicle(String),
}

/// In-memory vehicle records, keyed by identifier, in insertion order.
#[derive(Debug, Default)]
pub struct VehicleStore {
    vehicles: Mutex<Vec<Vehicle>>,
}

impl VehicleStore {
    pub fn new(vehicles: Vec<Vehicle>) -> Self {
        Self {
            vehicles: Mutex::new(vehicles),
        }
    }

    /// The two built-in vehicles wired to `GPS/location/1` and `GPS/location/2`.
    pub fn with_builtin_fleet(telemetry_prefix: &str) -> Self {
        Self::new(vec![
            Vehicle::builtin(1, 25.0, format!("{}/1", telemetry_prefix)),
            Vehicle::builtin(2, 27.0, format!("{}/2", telemetry_prefix)),
        ])
    }

    fn vehicles(&self) -> MutexGuard<'_, Vec<Vehicle>> {
        self.vehicles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, vehicle_id: &str, change: F) -> Result<Vehicle, StoreError>
    where
        F: FnOnce(&mut Vehicle),
    {
        let mut vehicles = self.vehicles();
        let vehicle = vehicles
            .iter_mut()
            .find(|v| v.id == vehicle_id)
            .ok_or_else(|| StoreError::UnknownVehicle(vehicle_id.to_string()))?;
        change(vehicle);
        Ok(vehicle.clone())
    }

    pub fn get(&self, vehicle_id: &str) -> Option<Vehicle> {
        self.vehicles().iter().find(|v| v.id == vehicle_id).cloned()
    }

    pub fn list(&self) -> Vec<Vehicle> {
        self.vehicles().clone()
    }

    /// Merges a reading into the record. Custom vehicles are left untouched.
    ///
    /// Returns the updated record, or `None` when nothing changed.
    pub fn apply_telemetry(&self, vehicle_id: &str, telemetry: Telemetry) -> Option<Vehicle> {
        let mut vehicles = self.vehicles();
        let vehicle = vehicles
            .iter_mut()
            .find(|v| v.id == vehicle_id && !v.is_custom)?;

        if let Some(temperature) = telemetry.temperature {
            vehicle.temperature = temperature;
        }
        vehicle.latitude = Some(telemetry.latitude);
        vehicle.longitude = Some(telemetry.longitude);
        Some(vehicle.clone())
    }

    pub fn toggle_engine(&self, vehicle_id: &str) -> Result<Vehicle, StoreError> {
        self.update(vehicle_id, |v| v.is_on = !v.is_on)
    }

    pub fn toggle_door_lock(&self, vehicle_id: &str) -> Result<Vehicle, StoreError> {
        self.update(vehicle_id, |v| v.door_locked = !v.door_locked)
    }

    /// Adds a display-only vehicle with the next sequential identifier.
    pub fn add_vehicle(&self, new_vehicle: NewVehicle) -> Vehicle {
        let mut vehicles = self.vehicles();
        let vehicle = Vehicle {
            id: format!("vehicle-{}", vehicles.len() + 1),
            name: format!("Vehicle {}", new_vehicle.vehicle_number),
            is_on: false,
            temperature: 25.0,
            door_locked: true,
            latitude: Some(new_vehicle.latitude),
            longitude: Some(new_vehicle.longitude),
            topic: None,
            is_custom: true,
            vehicle_number: Some(new_vehicle.vehicle_number),
        };
        vehicles.push(vehicle.clone());
        vehicle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VehicleStore {
        VehicleStore::with_builtin_fleet("GPS/location")
    }

    fn reading(temperature: Option<f64>) -> Telemetry {
        Telemetry {
            latitude: 12.34,
            longitude: 56.78,
            temperature,
        }
    }

    #[test]
    fn builtin_fleet_matches_dashboard_defaults() {
        let vehicles = store().list();

        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].id, "vehicle-1");
        assert_eq!(vehicles[0].temperature, 25.0);
        assert_eq!(vehicles[0].topic.as_deref(), Some("GPS/location/1"));
        assert_eq!(vehicles[1].id, "vehicle-2");
        assert_eq!(vehicles[1].temperature, 27.0);
        assert!(vehicles.iter().all(|v| !v.is_on && v.door_locked && !v.is_custom));
    }

    #[test]
    fn telemetry_merges_without_touching_other_fields() {
        let store = store();
        store.toggle_engine("vehicle-1").unwrap();

        let updated = store.apply_telemetry("vehicle-1", reading(Some(30.0))).unwrap();
        assert_eq!(updated.temperature, 30.0);
        assert_eq!(updated.latitude, Some(12.34));
        assert!(updated.is_on);

        let updated = store.apply_telemetry("vehicle-1", reading(None)).unwrap();
        assert_eq!(updated.temperature, 30.0);
        assert_eq!(store.get("vehicle-2").unwrap().latitude, None);
    }

    #[test]
    fn telemetry_never_moves_custom_vehicles() {
        let store = store();
        let custom = store.add_vehicle(NewVehicle {
            vehicle_number: 9,
            latitude: 1.0,
            longitude: 2.0,
        });

        assert!(store.apply_telemetry(&custom.id, reading(Some(40.0))).is_none());
        assert_eq!(store.get(&custom.id).unwrap(), custom);
        assert!(store.apply_telemetry("vehicle-99", reading(None)).is_none());
    }

    #[test]
    fn toggles_address_exactly_one_vehicle() {
        let store = store();

        assert!(store.toggle_engine("vehicle-2").unwrap().is_on);
        assert!(!store.toggle_door_lock("vehicle-2").unwrap().door_locked);

        let first = store.get("vehicle-1").unwrap();
        assert!(!first.is_on);
        assert!(first.door_locked);

        assert!(!store.toggle_engine("vehicle-2").unwrap().is_on);
        assert_eq!(
            store.toggle_engine("vehicle-7"),
            Err(StoreError::UnknownVehicle("vehicle-7".to_string()))
        );
    }

    #[test]
    fn added_vehicle_is_custom_and_sequential() {
        let store = store();

        let vehicle = store.add_vehicle(NewVehicle {
            vehicle_number: 9,
            latitude: 1.0,
            longitude: 2.0,
        });

        assert_eq!(vehicle.id, "vehicle-3");
        assert_eq!(vehicle.name, "Vehicle 9");
        assert!(vehicle.is_custom);
        assert!(!vehicle.is_on);
        assert!(vehicle.door_locked);
        assert_eq!(vehicle.latitude, Some(1.0));
        assert_eq!(vehicle.longitude, Some(2.0));
        assert_eq!(vehicle.vehicle_number, Some(9));

        let next = store.add_vehicle(NewVehicle {
            vehicle_number: 10,
            latitude: 0.0,
            longitude: 0.0,
        });
        assert_eq!(next.id, "vehicle-4");
        assert_eq!(store.list().len(), 4);
    }
}
