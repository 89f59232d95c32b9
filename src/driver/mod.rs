// Card printer driver boundary.
//
// `SmartDriver` mirrors the vendor library's entry points one to one, with
// every call returning the driver's raw status (0 = success). `DriverPort`
// is the only way the rest of the crate reaches a driver: it moves each
// blocking call onto the blocking pool, serializes calls, and bounds them
// with a watchdog.

mod mock;
mod native;

pub use mock::{CallKind, DriverCall, MockDevice, MockDriver};
pub use native::NativeDriver;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::errors::DriverError;
use crate::wire::{DrawTextInfo, RawDeviceList, DESCRIPTION_UNITS};

/// Opaque device handle returned by `openDevice`. Never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Handle)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Page and panel addressed by a draw command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub page: u8,
    pub panel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Decoded image handed to `drawImage`: packed top-down RGB24 rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PixelBuffer {
    pub const BITS_PER_PIXEL: u32 = 24;

    pub fn stride(&self) -> u32 {
        self.width * 3
    }
}

/// The vendor driver's entry points.
///
/// Implementations are called from blocking worker threads, one call at a
/// time (see `DriverPort`).
pub trait SmartDriver: Send + Sync {
    fn enumerate_devices(&self, list: &mut RawDeviceList) -> i32;
    /// Returns the status and the raw handle written by the driver.
    fn open_device(&self, descriptor: &[u16; DESCRIPTION_UNITS], mode: i32) -> (i32, usize);
    fn draw_image(&self, handle: Handle, target: Target, rect: Rect, image: &PixelBuffer) -> i32;
    /// `text` is null terminated.
    fn draw_text(&self, handle: Handle, target: Target, info: &DrawTextInfo, text: &[u16]) -> i32;
    fn commit_print(&self, handle: Handle) -> i32;
    fn close_device(&self, handle: Handle) -> i32;
    fn type_name(&self) -> &'static str;
}

/// Serialized, watchdog-bounded access to a `SmartDriver`.
#[derive(Clone)]
pub struct DriverPort {
    driver: Arc<dyn SmartDriver>,
    gate: Arc<Mutex<()>>,
    call_timeout: Duration,
}

impl DriverPort {
    pub fn new(driver: Arc<dyn SmartDriver>, call_timeout: Duration) -> Self {
        Self {
            driver,
            gate: Arc::new(Mutex::new(())),
            call_timeout,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.driver.type_name()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Runs `f` against the driver on the blocking pool.
    ///
    /// The gate is held for the whole call, so a call that outlives its
    /// watchdog still blocks the next one until it returns.
    pub async fn call<T, F>(&self, call: &'static str, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&dyn SmartDriver) -> T + Send + 'static,
        T: Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let gate = Arc::clone(&self.gate);
        debug!("Driver call {} queued", call);

        let task = tokio::task::spawn_blocking(move || {
            let _serialized = gate.lock().unwrap_or_else(PoisonError::into_inner);
            f(driver.as_ref())
        });

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("Driver call {} aborted: {}", call, e);
                Err(DriverError::CallAborted { call })
            }
            Err(_) => {
                warn!(
                    "Driver call {} exceeded watchdog of {:?}",
                    call, self.call_timeout
                );
                Err(DriverError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for DriverPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPort")
            .field("driver", &self.driver.type_name())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Builds the driver selected by configuration.
///
/// The mock is only used when explicitly requested; a missing native library
/// is an error rather than a silent fallback.
pub fn new_driver(config: &DriverConfig) -> Result<Arc<dyn SmartDriver>, DriverError> {
    if config.use_mock {
        warn!("USE_MOCK_DRIVER is set, prints will not reach a device");
        return Ok(Arc::new(MockDriver::new().with_device(MockDevice::default())));
    }

    info!("Loading printer driver from {:?}", config.library_path);
    let driver = NativeDriver::load(&config.library_path)?;
    info!(
        "Printer driver loaded: {} ({})",
        driver.type_name(),
        driver.path().display()
    );
    Ok(Arc::new(driver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_rejects_null() {
        assert!(Handle::from_raw(0).is_none());
        assert_eq!(Handle::from_raw(0x2a).map(Handle::as_raw), Some(0x2a));
    }

    #[tokio::test]
    async fn test_port_returns_call_result() {
        let port = DriverPort::new(Arc::new(MockDriver::new()), Duration::from_secs(1));
        let name = port.call("type_name", |d| d.type_name()).await;
        assert_eq!(name, Ok("Mock SmartComm Driver"));
    }

    #[tokio::test]
    async fn test_port_times_out_slow_call() {
        let port = DriverPort::new(Arc::new(MockDriver::new()), Duration::from_millis(20));
        let result = port
            .call("slow", |_| std::thread::sleep(Duration::from_millis(200)))
            .await;
        assert_eq!(result, Err(DriverError::Timeout));
    }

    #[tokio::test]
    async fn test_port_serializes_after_timeout() {
        let port = DriverPort::new(Arc::new(MockDriver::new()), Duration::from_millis(20));
        let started = std::time::Instant::now();
        let _ = port
            .call("slow", |_| std::thread::sleep(Duration::from_millis(150)))
            .await;

        let relaxed = DriverPort {
            call_timeout: Duration::from_secs(2),
            ..port.clone()
        };
        relaxed.call("next", |_| ()).await.unwrap();
        // the second call could only run once the first released the gate
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_port_reports_panicking_call() {
        let port = DriverPort::new(Arc::new(MockDriver::new()), Duration::from_secs(1));
        let result: Result<(), _> = port.call("boom", |_| panic!("driver crashed")).await;
        assert_eq!(result, Err(DriverError::CallAborted { call: "boom" }));
    }

    #[test]
    fn test_new_driver_uses_mock_when_requested() {
        let config = DriverConfig {
            library_path: "missing.dll".into(),
            use_mock: true,
            call_timeout: Duration::from_secs(1),
        };
        let driver = new_driver(&config).unwrap();
        assert_eq!(driver.type_name(), "Mock SmartComm Driver");
    }

    #[test]
    fn test_new_driver_reports_missing_library() {
        let config = DriverConfig {
            library_path: "/nonexistent/SmartComm2.dll".into(),
            use_mock: false,
            call_timeout: Duration::from_secs(1),
        };
        assert!(matches!(new_driver(&config), Err(DriverError::Library(_))));
    }
}
