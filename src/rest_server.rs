use crate::config::Config;
use crate::fleet::{Fleet, FleetError};
use crate::location_client::{LocationClient, LocationError};
use crate::models::{Alert, GeofenceReport, NewVehicle, Vehicle};
use crate::status_publisher::CommandError;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::figment::Figment;
use rocket::http::Status;
use rocket::serde::json::{Json, Value};
use rocket::serde::Serialize;
use rocket::{delete, get, options, post, routes, Build, Rocket, State};
use std::sync::Arc;
use tracing::warn;

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, DELETE, OPTIONS",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

fn fleet_status(error: FleetError) -> Status {
    warn!("Vehicle action failed: {}", error);
    match error {
        FleetError::Store(_) => Status::NotFound,
        FleetError::Command(CommandError::UnroutableVehicle(_)) => Status::UnprocessableEntity,
        FleetError::Command(CommandError::Broker(_)) => Status::BadGateway,
        FleetError::Command(CommandError::Encode(_)) => Status::InternalServerError,
    }
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "Vehicle tracker API".to_string(),
    })
}

/// Answers CORS preflight requests for every route.
#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

#[get("/vehicles")]
fn list_vehicles(fleet: &State<Arc<Fleet>>) -> Json<Vec<Vehicle>> {
    Json(fleet.vehicles().list())
}

#[post("/vehicles", data = "<payload>")]
fn add_vehicle(payload: Json<NewVehicle>, fleet: &State<Arc<Fleet>>) -> (Status, Json<Vehicle>) {
    let vehicle = fleet.vehicles().add_vehicle(payload.into_inner());
    (Status::Created, Json(vehicle))
}

/// Flips the engine state and sends the command to the vehicle.
#[post("/vehicles/<id>/engine")]
async fn toggle_engine(id: &str, fleet: &State<Arc<Fleet>>) -> Result<Json<Vehicle>, Status> {
    fleet.toggle_engine(id).await.map(Json).map_err(fleet_status)
}

#[post("/vehicles/<id>/door")]
fn toggle_door(id: &str, fleet: &State<Arc<Fleet>>) -> Result<Json<Vehicle>, Status> {
    fleet.toggle_door_lock(id).map(Json).map_err(fleet_status)
}

/// Last known location from the upstream location API.
#[get("/vehicles/<id>/location")]
async fn latest_location(id: &str, locations: &State<LocationClient>) -> Result<Json<Value>, Status> {
    match locations.latest(id).await {
        Ok(data) => Ok(Json(data)),
        Err(LocationError::NoData) => Err(Status::NotFound),
        Err(_) => Err(Status::BadGateway),
    }
}

#[get("/alerts")]
fn list_alerts(fleet: &State<Arc<Fleet>>) -> Json<Vec<Alert>> {
    Json(fleet.alerts().list())
}

/// A geofence crossing detected by the map view.
#[post("/alerts", data = "<report>")]
fn report_alert(report: Json<GeofenceReport>, fleet: &State<Arc<Fleet>>) -> Result<Json<Alert>, Status> {
    fleet
        .report_geofence(&report.vehicle_id, report.is_outside)
        .map(Json)
        .ok_or(Status::NotFound)
}

#[delete("/alerts/<id>")]
fn dismiss_alert(id: u64, fleet: &State<Arc<Fleet>>) -> Status {
    if fleet.alerts().dismiss(id) {
        Status::NoContent
    } else {
        Status::NotFound
    }
}

pub fn api_figment(config: &Config) -> Figment {
    rocket::Config::figment()
        .merge(("address", config.api_address.clone()))
        .merge(("port", config.api_port))
}

pub fn build_rocket(fleet: Arc<Fleet>, locations: LocationClient, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(fleet)
        .manage(locations)
        .mount(
            "/api",
            routes![
                root_handler,
                preflight,
                list_vehicles,
                add_vehicle,
                toggle_engine,
                toggle_door,
                latest_location,
                list_alerts,
                report_alert,
                dismiss_alert,
            ],
        )
        .attach(Cors)
}

/// Serves the API until Rocket shuts down (Ctrl-C by default).
pub async fn run_rest_server(
    fleet: Arc<Fleet>,
    locations: LocationClient,
    config: &Config,
) -> Result<(), rocket::Error> {
    build_rocket(fleet, locations, api_figment(config)).launch().await?;
    Ok(())
}
