use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Everything that can go wrong while talking to the card printer driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Device enumeration failed (code {0})")]
    EnumerationFailed(i32),

    #[error("No printer device available")]
    NoDeviceAvailable,

    #[error("Failed to open device (code {0})")]
    OpenFailed(i32),

    #[error("A device session is already open")]
    AlreadyOpen,

    #[error("Device descriptor cannot be encoded for the driver")]
    InvalidDescriptor,

    #[error("Image source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Failed to decode image {}: {reason}", path.display())]
    ImageDecode { path: PathBuf, reason: String },

    #[error("Text draw command has no text")]
    EmptyText,

    #[error("{field} exceeds {capacity} UTF-16 units")]
    FieldTooLong { field: &'static str, capacity: usize },

    #[error("Draw command failed (code {0})")]
    DrawFailed(i32),

    #[error("Print commit failed (code {0})")]
    CommitFailed(i32),

    #[error("Failed to close device (code {0})")]
    CloseFailed(i32),

    #[error("No device session is open")]
    NotOpen,

    #[error("Device open was abandoned before it completed")]
    Abandoned,

    #[error("Driver call timed out")]
    Timeout,

    #[error("Driver call {call} aborted")]
    CallAborted { call: &'static str },

    #[error("Driver library unavailable: {0}")]
    Library(String),
}

impl DriverError {
    /// Raw driver status code, when the failure came from one.
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::EnumerationFailed(code)
            | DriverError::OpenFailed(code)
            | DriverError::DrawFailed(code)
            | DriverError::CommitFailed(code)
            | DriverError::CloseFailed(code) => Some(*code),
            _ => None,
        }
    }
}

// Serialized as `{ "message", "code" }` for status events and job history.
impl Serialize for DriverError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DriverError", 2)?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("code", &self.code())?;
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("A print job is already running")]
    Busy,

    #[error("Print job task ended without an outcome")]
    JobLost,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid driver call timeout")]
    InvalidTimeout,

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Initialization(_) => 500,
            AppError::Driver(DriverError::SourceNotFound(_)) => 404,
            AppError::Driver(DriverError::Timeout) => 504,
            AppError::Driver(_) => 503,
            AppError::Pipeline(PipelineError::Busy) => 409,
            AppError::Pipeline(_) => 500,
            AppError::Config(_) => 500,
            AppError::Database(_) => 503,
            AppError::BadRequest(_) => 400,
        }
    }

    pub fn error_response(&self) -> serde_json::Value {
        let code = match self {
            AppError::Driver(e) => e.code(),
            _ => None,
        };
        serde_json::json!({
            "ok": false,
            "error": self.to_string(),
            "error_type": self.error_type(),
            "driver_code": code
        })
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Initialization(_) => "initialization_error",
            AppError::Driver(_) => "driver_error",
            AppError::Pipeline(_) => "pipeline_error",
            AppError::Config(_) => "config_error",
            AppError::Database(_) => "database_error",
            AppError::BadRequest(_) => "bad_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::OpenFailed(1);
        assert_eq!(err.to_string(), "Failed to open device (code 1)");

        let err = DriverError::SourceNotFound(PathBuf::from("/tmp/missing.png"));
        assert_eq!(err.to_string(), "Image source not found: /tmp/missing.png");
    }

    #[test]
    fn test_driver_codes() {
        assert_eq!(DriverError::DrawFailed(-7).code(), Some(-7));
        assert_eq!(DriverError::CloseFailed(3).code(), Some(3));
        assert_eq!(DriverError::Timeout.code(), None);
        assert_eq!(DriverError::AlreadyOpen.code(), None);
    }

    #[test]
    fn test_app_error_status_codes() {
        let err = AppError::Driver(DriverError::SourceNotFound(PathBuf::from("a.png")));
        assert_eq!(err.status_code(), 404);

        let err = AppError::Pipeline(PipelineError::Busy);
        assert_eq!(err.status_code(), 409);

        let err = AppError::Driver(DriverError::OpenFailed(1));
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_error_response_json() {
        let err = AppError::Driver(DriverError::CommitFailed(12));
        let json = err.error_response();

        assert_eq!(json["ok"], false);
        assert_eq!(
            json["error"],
            "Driver error: Print commit failed (code 12)"
        );
        assert_eq!(json["error_type"], "driver_error");
        assert_eq!(json["driver_code"], 12);
    }

    #[test]
    fn test_driver_error_serializes_message_and_code() {
        let json = serde_json::to_value(DriverError::DrawFailed(2)).unwrap();
        assert_eq!(json["message"], "Draw command failed (code 2)");
        assert_eq!(json["code"], 2);

        let json = serde_json::to_value(DriverError::Timeout).unwrap();
        assert!(json["code"].is_null());
    }

    #[test]
    fn test_database_errors_are_unavailable() {
        let err = AppError::from(DatabaseError::MigrationFailed("checksum mismatch".to_string()));
        assert_eq!(err.status_code(), 503);

        let json = err.error_response();
        assert_eq!(json["error_type"], "database_error");
        assert_eq!(
            json["error"],
            "Database error: Migration failed: checksum mismatch"
        );
        assert!(json["driver_code"].is_null());
    }
}
