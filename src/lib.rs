// Library module organization

pub mod compositor;
pub mod config;
pub mod device_session;
pub mod driver;
pub mod errors;
pub mod job_history;
pub mod pipeline;
pub mod registry;
pub mod status;
pub mod templates;
pub mod wire;

// Re-export commonly used types for convenience
pub use compositor::{Color, DrawCommand, SurfaceCompositor, TextStyle};
pub use config::Config;
pub use device_session::DeviceSession;
pub use driver::{new_driver, DriverPort, Handle, MockDriver, NativeDriver, SmartDriver};
pub use errors::{AppError, AppResult, DriverError, PipelineError};
pub use pipeline::{
    CancelFlag, DeviceSelection, FailureReason, JobOutcome, PipelineState, PrintJob,
    PrintJobSpec, PrintPipeline,
};
pub use registry::{DeviceDescriptor, DeviceList, DeviceRegistry};
pub use status::{BroadcastReporter, FanOut, StatusEvent, StatusKind, StatusSink};
