// Card printing kiosk: HTTP front end over the SmartComm card printer driver.

use actix_files as fs;
use actix_web::{middleware, web, App, HttpServer};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod routes;

use card_kiosk::config::{self, Config};
use card_kiosk::errors::DatabaseError;
use card_kiosk::job_history::HistoryRecorder;
use card_kiosk::{new_driver, AppError, BroadcastReporter, DriverPort, FanOut, PrintPipeline};
use routes::ActiveJob;

const EVENT_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Application State
// ============================================================================

/// Centralized application state container
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db_pool: SqlitePool,
    pub pipeline: Arc<PrintPipeline>,
    pub events: BroadcastReporter,
    pub history: Arc<HistoryRecorder>,
    pub active_job: web::Data<ActiveJob>,
}

impl AppState {
    /// Create a new application state instance
    async fn new(config: Config) -> Result<Self, AppError> {
        info!("Initializing application state");

        let db_pool = Self::initialize_database(&config.database).await?;

        let driver = new_driver(&config.driver)?;
        let port = DriverPort::new(driver, config.driver.call_timeout);
        info!(
            "Driver ready: {} (call watchdog {:?})",
            port.type_name(),
            config.driver.call_timeout
        );

        let events = BroadcastReporter::new(EVENT_BUFFER);
        let history = Arc::new(HistoryRecorder::spawn(db_pool.clone()));
        let sink = FanOut::new()
            .with(Arc::new(events.clone()))
            .with(history.clone());
        let pipeline = Arc::new(PrintPipeline::new(port, Arc::new(sink)));

        Ok(Self {
            config,
            db_pool,
            pipeline,
            events,
            history,
            active_job: web::Data::new(ActiveJob::new(None)),
        })
    }

    async fn initialize_database(
        db_config: &config::DatabaseConfig,
    ) -> Result<SqlitePool, AppError> {
        info!("Initializing database at: {:?}", db_config.path);

        if let Some(parent) = db_config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Initialization(format!("Failed to create database directory: {}", e))
            })?;
        }

        let pool = SqlitePool::connect(&db_config.connection_string())
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        info!("Database connected and migrations completed");
        Ok(pool)
    }
}

// ============================================================================
// Shutdown Handling
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn cleanup_resources(state: AppState) {
    info!("Beginning resource cleanup");

    // Abandon any running job so its device handle is closed before exit
    let job = state.active_job.lock().await.take();
    if let Some(mut job) = job {
        if !job.is_finished() {
            info!("Abandoning running print job {}", job.id());
            job.abandon().await;
            let finished = tokio::time::timeout(SHUTDOWN_GRACE, job.wait()).await;
            match finished {
                Ok(Ok(outcome)) => info!("Print job {} ended: {:?}", job.id(), outcome),
                Ok(Err(e)) => warn!("Print job {} ended without outcome: {}", job.id(), e),
                Err(_) => warn!(
                    "Print job {} did not stop within {:?}",
                    job.id(),
                    SHUTDOWN_GRACE
                ),
            }
        }
    }
    if !state.pipeline.session().is_released() {
        warn!("Device still open at shutdown, closing");
        if let Err(e) = state.pipeline.session().close().await {
            warn!("Final device close failed: {}", e);
        }
    }

    // Store every finished job before the pool goes away
    state.history.shutdown().await;
    info!("Job history flushed");

    state.db_pool.close().await;
    info!("Database connections closed");

    info!("Resource cleanup complete");
}

fn io_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // ========================================
    // Phase 1: Basic Initialization
    // ========================================

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting card kiosk");

    // ========================================
    // Phase 2: Configuration & State Setup
    // ========================================

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        io_error("Failed to load configuration", e)
    })?;
    let socket_addr = config.socket_addr().map_err(|e| {
        error!("Configuration error: {}", e);
        io_error("Invalid bind address", e)
    })?;

    info!("Configuration loaded successfully");
    info!("Server will bind to: {}", socket_addr);

    let app_state = AppState::new(config.clone()).await.map_err(|e| {
        error!("Application initialization error: {}", e);
        io_error("Failed to initialize application", e)
    })?;

    // ========================================
    // Phase 3: HTTP Server Setup
    // ========================================

    let app_state_for_server = app_state.clone();

    let server = HttpServer::new(move || {
        let state = app_state_for_server.clone();
        App::new()
            // Middleware
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            // Application state
            .app_data(web::Data::new(state.config.clone()))
            .app_data(web::Data::new(state.db_pool.clone()))
            .app_data(web::Data::new(state.pipeline.clone()))
            .app_data(web::Data::new(state.events.clone()))
            .app_data(state.active_job.clone())
            // Devices and printing
            .service(routes::list_devices)
            .service(routes::print_card)
            .service(routes::cancel_print)
            .service(routes::print_state)
            .service(routes::print_events)
            // Job history
            .service(routes::recent_jobs)
            .service(routes::get_job)
            // Presentation bundle
            .service(fs::Files::new("/static", state.config.storage.static_path.clone()))
    })
    .bind(socket_addr)?
    .shutdown_timeout(5)
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(async move { server.await });

    info!("Card kiosk server started on {}", socket_addr);
    info!("System ready for operation");

    // ========================================
    // Phase 4: Run Until Shutdown
    // ========================================

    shutdown_signal().await;

    // ========================================
    // Phase 5: Graceful Shutdown
    // ========================================

    info!("Initiating graceful shutdown...");

    server_handle.stop(true).await;

    cleanup_resources(app_state).await;

    server_task
        .await
        .map_err(|e| io_error("Server task error", e))??;

    info!("Graceful shutdown complete");
    Ok(())
}
