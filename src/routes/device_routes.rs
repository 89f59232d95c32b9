use actix_web::{get, web, HttpResponse, Responder};
use std::sync::Arc;
use tracing::{info, warn};

use card_kiosk::{AppError, PrintPipeline};

use super::error_reply;

#[get("/devices")]
pub async fn list_devices(pipeline: web::Data<Arc<PrintPipeline>>) -> impl Responder {
    match pipeline.registry().list_devices().await {
        Ok(devices) => {
            info!("Device list requested: {} device(s)", devices.len());
            HttpResponse::Ok().json(serde_json::json!({
                "ok": true,
                "devices": devices
            }))
        }
        Err(e) => {
            warn!("Device enumeration failed: {}", e);
            error_reply(&AppError::Driver(e))
        }
    }
}
