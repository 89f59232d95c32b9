// Route modules organization

pub mod device_routes;
pub mod history_routes;
pub mod print_routes;

// Re-export all routes for convenience
pub use device_routes::*;
pub use history_routes::*;
pub use print_routes::*;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use card_kiosk::{AppError, PrintJob};
use tokio::sync::Mutex;

/// The job started by the most recent `POST /print`, if any.
pub type ActiveJob = Mutex<Option<PrintJob>>;

pub(crate) fn error_reply(err: &AppError) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(err.error_response())
}
