use serde::{Deserialize, Serialize};

/// A tracked vehicle as the dashboard sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub name: String,
    pub is_on: bool,
    pub temperature: f64,
    pub door_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub is_custom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_number: Option<u32>,
}

impl Vehicle {
    /// A vehicle wired to live telemetry on the given topic.
    pub fn builtin(number: u32, temperature: f64, topic: impl Into<String>) -> Self {
        Self {
            id: format!("vehicle-{}", number),
            name: format!("Vehicle {}", number),
            is_on: false,
            temperature,
            door_locked: true,
            latitude: None,
            longitude: None,
            topic: Some(topic.into()),
            is_custom: false,
            vehicle_number: None,
        }
    }
}

/// Request body for adding a display-only vehicle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVehicle {
    pub vehicle_number: u32,
    pub latitude: f64,
    pub longitude: f64,
}

/// Normalized position/temperature reading for one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: u64,
    pub vehicle_id: String,
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub severity: Severity,
}

/// Body of a map-reported geofence crossing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceReport {
    pub vehicle_id: String,
    pub is_outside: bool,
}

/// Extracts `7` from `vehicle-7`.
pub fn numeric_suffix(vehicle_id: &str) -> Option<u32> {
    let prefix = vehicle_id.trim_end_matches(|c: char| c.is_ascii_digit());
    vehicle_id[prefix.len()..].parse().ok()
}
