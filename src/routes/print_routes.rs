use actix_web::{get, post, web, HttpResponse, Responder};
use bytes::Bytes;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use card_kiosk::config::Config;
use card_kiosk::templates::PrintTemplate;
use card_kiosk::{AppError, BroadcastReporter, PipelineError, PrintPipeline};

use super::{error_reply, ActiveJob};

#[derive(Debug, Deserialize)]
pub struct PrintRequest {
    /// File name of the photo under the storage directory.
    pub photo: String,
    #[serde(default)]
    pub text: String,
    /// Background file name under the static directory; the configured
    /// background is used when omitted.
    pub background: Option<String>,
}

/// A bare file name: one normal path component and no drive or separator
/// characters on any platform.
fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\', ':']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn resolve_background(
    config: &Config,
    requested: Option<&str>,
) -> Result<Option<PathBuf>, AppError> {
    match requested {
        Some(name) if !is_plain_file_name(name) => {
            Err(AppError::BadRequest("Invalid background file name".to_string()))
        }
        Some(name) => Ok(Some(config.storage.static_path.join(name))),
        None => {
            let default = config.background_path();
            if default.is_file() {
                Ok(Some(default))
            } else {
                warn!("Configured background {:?} not found, printing without it", default);
                Ok(None)
            }
        }
    }
}

#[post("/print")]
pub async fn print_card(
    body: web::Json<PrintRequest>,
    config: web::Data<Config>,
    pipeline: web::Data<Arc<PrintPipeline>>,
    active: web::Data<ActiveJob>,
) -> impl Responder {
    let request = body.into_inner();
    info!("Print request received for photo '{}'", request.photo);

    if !is_plain_file_name(&request.photo) {
        return error_reply(&AppError::BadRequest("Invalid photo file name".to_string()));
    }
    let photo_path = config.photos_path().join(&request.photo);
    if !photo_path.is_file() {
        warn!("Photo not found at {:?}", photo_path);
        return HttpResponse::NotFound().json(serde_json::json!({
            "ok": false,
            "error": format!("Photo not found: {}", request.photo)
        }));
    }

    let background = match resolve_background(&config, request.background.as_deref()) {
        Ok(background) => background,
        Err(e) => return error_reply(&e),
    };

    let mut template = PrintTemplate::new(config.layout.clone());
    if let Some(background) = background {
        template = template.with_background(background);
    }
    let spec = template.build(&photo_path, &request.text);
    debug!("Built {} draw command(s)", spec.commands.len());

    let mut slot = active.lock().await;
    match pipeline.start(spec) {
        Ok(job) => {
            let job_id = job.id();
            info!("Print job {} accepted", job_id);
            *slot = Some(job);
            HttpResponse::Ok().json(serde_json::json!({
                "ok": true,
                "job_id": job_id
            }))
        }
        Err(PipelineError::Busy) => {
            warn!("Print request rejected: a job is already running");
            error_reply(&AppError::Pipeline(PipelineError::Busy))
        }
        Err(e) => error_reply(&AppError::Pipeline(e)),
    }
}

#[post("/print/cancel")]
pub async fn cancel_print(active: web::Data<ActiveJob>) -> impl Responder {
    let slot = active.lock().await;
    match slot.as_ref() {
        Some(job) if !job.is_finished() => {
            job.abandon().await;
            HttpResponse::Ok().json(serde_json::json!({
                "ok": true,
                "job_id": job.id(),
                "message": "Print job abandoned"
            }))
        }
        _ => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "message": "No print job running"
        })),
    }
}

#[get("/print/state")]
pub async fn print_state(
    pipeline: web::Data<Arc<PrintPipeline>>,
    active: web::Data<ActiveJob>,
) -> impl Responder {
    let job_id = active.lock().await.as_ref().map(|job| job.id());
    HttpResponse::Ok().json(serde_json::json!({
        "ok": true,
        "job_id": job_id,
        "busy": pipeline.is_busy(),
        "state": pipeline.state()
    }))
}

#[get("/print/events")]
pub async fn print_events(reporter: web::Data<BroadcastReporter>) -> impl Responder {
    let mut events = reporter.subscribe();
    info!("Status event stream opened");

    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        let frame = format!("event: status\ndata: {}\n\n", json);
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(frame));
                    }
                    Err(e) => warn!("Failed to serialize status event: {}", e),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!("Status stream lagged, {} event(s) dropped", missed);
                    let frame = format!("event: lagged\ndata: {}\n\n", missed);
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(frame));
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Status event stream closed");
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("photo_1.jpg"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name("a/b.png"));
        assert!(!is_plain_file_name(""));
    }

    #[test]
    fn test_file_names_cannot_leave_directory() {
        assert!(is_plain_file_name("card..back.png"));
        assert!(!is_plain_file_name("C:secret.png"));
        assert!(!is_plain_file_name("C:\\secret.png"));
        assert!(!is_plain_file_name("a\\b.png"));
        assert!(!is_plain_file_name("/abs.png"));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("photo.jpg/"));
    }

    #[test]
    fn test_print_request_defaults() {
        let request: PrintRequest =
            serde_json::from_value(serde_json::json!({ "photo": "p.jpg" })).unwrap();
        assert_eq!(request.text, "");
        assert!(request.background.is_none());
    }
}
