use actix_web::{get, web, HttpResponse, Responder};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{error, warn};

use card_kiosk::job_history::JobRecord;

use super::error_reply;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<u32>,
}

#[get("/jobs")]
pub async fn recent_jobs(
    query: web::Query<HistoryQuery>,
    db_pool: web::Data<SqlitePool>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    match JobRecord::recent(limit, &db_pool).await {
        Ok(jobs) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "jobs": jobs
        })),
        Err(e) => {
            error!("Failed to list print jobs: {}", e);
            error_reply(&e)
        }
    }
}

#[get("/jobs/{id}")]
pub async fn get_job(path: web::Path<String>, db_pool: web::Data<SqlitePool>) -> impl Responder {
    let id = path.into_inner();
    match JobRecord::load(&id, &db_pool).await {
        Ok(Some(job)) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "job": job
        })),
        Ok(None) => {
            warn!("Print job {} not found", id);
            HttpResponse::NotFound().json(serde_json::json!({
                "ok": false,
                "error": "Print job not found"
            }))
        }
        Err(e) => {
            error!("Failed to load print job {}: {}", id, e);
            error_reply(&e)
        }
    }
}
