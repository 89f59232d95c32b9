// Ownership of the single open device handle.
//
// The slot moves Empty -> Opening -> Live -> Empty. Close takes the handle
// out of the slot before the native close runs, so a handle is forgotten
// even when closing fails or times out. A close that arrives while an open
// is still in flight marks the open abandoned, and the opener closes the
// fresh handle itself.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::driver::{DriverPort, Handle, SmartDriver};
use crate::errors::DriverError;
use crate::registry::DeviceDescriptor;
use crate::wire::{encode_wide, DESCRIPTION_UNITS, OPEN_BY_DESCRIPTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Opening { abandoned: bool },
    Live(Handle),
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct DeviceSession {
    port: DriverPort,
    slot: Arc<Mutex<Slot>>,
    released: Arc<Notify>,
}

impl DeviceSession {
    pub fn new(port: DriverPort) -> Self {
        Self {
            port,
            slot: Arc::new(Mutex::new(Slot::Empty)),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn port(&self) -> &DriverPort {
        &self.port
    }

    /// The live handle, if a device is open.
    pub fn active_handle(&self) -> Option<Handle> {
        match *lock(&self.slot) {
            Slot::Live(handle) => Some(handle),
            _ => None,
        }
    }

    /// True when no handle is live and no open is in flight.
    pub fn is_released(&self) -> bool {
        *lock(&self.slot) == Slot::Empty
    }

    /// Waits up to `limit` for the slot to empty, e.g. for a timed-out open
    /// to come back and close its late handle. Returns whether it did.
    pub async fn wait_released(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_released() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_released();
            }
        }
    }

    fn mark_released(slot: &Mutex<Slot>, released: &Notify) {
        *lock(slot) = Slot::Empty;
        released.notify_waiters();
    }

    /// Opens `descriptor` by its description text.
    pub async fn open(&self, descriptor: &DeviceDescriptor) -> Result<Handle, DriverError> {
        let wire = {
            let mut slot = lock(&self.slot);
            if *slot != Slot::Empty {
                warn!("Refusing to open '{}': a session is already open", descriptor.name);
                return Err(DriverError::AlreadyOpen);
            }
            let wire = encode_wide::<DESCRIPTION_UNITS>(&descriptor.description)
                .filter(|_| !descriptor.description.is_empty())
                .ok_or(DriverError::InvalidDescriptor)?;
            *slot = Slot::Opening { abandoned: false };
            wire
        };

        info!("Opening device '{}'", descriptor.description);
        let slot = Arc::clone(&self.slot);
        let released = Arc::clone(&self.released);
        let result = self
            .port
            .call("openDevice", move |driver| {
                let (status, raw) = driver.open_device(&wire, OPEN_BY_DESCRIPTION);
                let handle = if status == 0 { Handle::from_raw(raw) } else { None };

                let abandoned = {
                    let mut current = lock(&slot);
                    let abandoned = matches!(*current, Slot::Opening { abandoned: true });
                    match handle {
                        Some(handle) if !abandoned => *current = Slot::Live(handle),
                        // stays Opening until the late handle is closed below
                        Some(_) => {}
                        None => *current = Slot::Empty,
                    }
                    abandoned
                };
                if handle.is_none() {
                    released.notify_waiters();
                }

                match handle {
                    Some(handle) if abandoned => {
                        let status = driver.close_device(handle);
                        Self::mark_released(&slot, &released);
                        warn!(
                            "Open completed after close was requested; closed handle {:#x} (code {})",
                            handle.as_raw(),
                            status
                        );
                        Err(DriverError::Abandoned)
                    }
                    Some(handle) => Ok(handle),
                    None => Err(DriverError::OpenFailed(status)),
                }
            })
            .await;

        match result {
            Ok(Ok(handle)) => {
                info!("Device opened with handle {:#x}", handle.as_raw());
                Ok(handle)
            }
            Ok(Err(e)) => {
                warn!("Device open failed: {}", e);
                Err(e)
            }
            Err(DriverError::Timeout) => {
                // the open is still running; whoever closes next abandons it
                Err(DriverError::Timeout)
            }
            Err(e) => {
                let mut slot = lock(&self.slot);
                if matches!(*slot, Slot::Opening { .. }) {
                    *slot = Slot::Empty;
                    self.released.notify_waiters();
                }
                Err(e)
            }
        }
    }

    /// Closes the live handle. Succeeds without a driver call when nothing is open.
    pub async fn close(&self) -> Result<(), DriverError> {
        let handle = {
            let mut slot = lock(&self.slot);
            match *slot {
                Slot::Empty => return Ok(()),
                Slot::Opening { .. } => {
                    info!("Close requested during open; marking open as abandoned");
                    *slot = Slot::Opening { abandoned: true };
                    return Ok(());
                }
                Slot::Live(handle) => {
                    *slot = Slot::Empty;
                    self.released.notify_waiters();
                    handle
                }
            }
        };

        info!("Closing device handle {:#x}", handle.as_raw());
        let status = self
            .port
            .call("closeDevice", move |driver| driver.close_device(handle))
            .await?;

        if status != 0 {
            warn!("Device close returned code {}; handle discarded", status);
            return Err(DriverError::CloseFailed(status));
        }
        Ok(())
    }

    /// Sends the composed surface to the printer.
    pub async fn commit(&self, handle: Handle) -> Result<(), DriverError> {
        let status = self
            .with_live_handle("commitPrint", handle, |driver, handle| {
                driver.commit_print(handle)
            })
            .await?;

        if status != 0 {
            return Err(DriverError::CommitFailed(status));
        }
        Ok(())
    }

    /// Runs a per-device driver call, provided `handle` is still the live one
    /// when the call reaches the driver.
    pub(crate) async fn with_live_handle<T, F>(
        &self,
        call: &'static str,
        handle: Handle,
        f: F,
    ) -> Result<T, DriverError>
    where
        F: FnOnce(&dyn SmartDriver, Handle) -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.slot);
        self.port
            .call(call, move |driver| {
                if *lock(&slot) != Slot::Live(handle) {
                    return Err(DriverError::NotOpen);
                }
                Ok(f(driver, handle))
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CallKind, MockDevice, MockDriver};
    use std::time::Duration;

    fn descriptor() -> DeviceDescriptor {
        let device = MockDevice::default();
        DeviceDescriptor {
            name: device.name,
            id: device.id,
            dev: device.dev,
            description: device.description,
            product_id: device.product_id,
        }
    }

    fn session(driver: MockDriver) -> (DeviceSession, Arc<MockDriver>) {
        session_with_timeout(driver, Duration::from_secs(2))
    }

    fn session_with_timeout(
        driver: MockDriver,
        timeout: Duration,
    ) -> (DeviceSession, Arc<MockDriver>) {
        let driver = Arc::new(driver);
        let port = DriverPort::new(driver.clone(), timeout);
        (DeviceSession::new(port), driver)
    }

    #[tokio::test]
    async fn test_open_stores_handle_and_passes_description() {
        let (session, driver) = session(MockDriver::new());
        let handle = session.open(&descriptor()).await.unwrap();

        assert_eq!(session.active_handle(), Some(handle));
        assert_eq!(
            driver.calls()[0],
            crate::driver::DriverCall::Open {
                descriptor: "IDP SMART-51 Dual (USB001)".to_string(),
                mode: OPEN_BY_DESCRIPTION,
            }
        );
    }

    #[tokio::test]
    async fn test_open_twice_is_already_open() {
        let (session, driver) = session(MockDriver::new());
        let first = session.open(&descriptor()).await.unwrap();

        assert_eq!(
            session.open(&descriptor()).await,
            Err(DriverError::AlreadyOpen)
        );
        assert_eq!(session.active_handle(), Some(first));
        assert_eq!(driver.count(CallKind::Open), 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_slot_empty() {
        let (session, _) = session(MockDriver::new().fail_open(1));
        assert_eq!(
            session.open(&descriptor()).await,
            Err(DriverError::OpenFailed(1))
        );
        assert!(session.is_released());
    }

    #[tokio::test]
    async fn test_null_handle_is_open_failure() {
        let (session, _) = session(MockDriver::new().with_null_handle());
        assert_eq!(
            session.open(&descriptor()).await,
            Err(DriverError::OpenFailed(0))
        );
        assert!(session.is_released());
    }

    #[tokio::test]
    async fn test_oversized_descriptor_is_rejected_before_driver() {
        let (session, driver) = session(MockDriver::new());
        let mut desc = descriptor();
        desc.description = "x".repeat(DESCRIPTION_UNITS);

        assert_eq!(
            session.open(&desc).await,
            Err(DriverError::InvalidDescriptor)
        );
        assert!(driver.calls().is_empty());
        assert!(session.is_released());

        desc.description = String::new();
        assert_eq!(
            session.open(&desc).await,
            Err(DriverError::InvalidDescriptor)
        );
    }

    #[tokio::test]
    async fn test_close_twice_calls_driver_once() {
        let (session, driver) = session(MockDriver::new());
        session.open(&descriptor()).await.unwrap();

        assert_eq!(session.close().await, Ok(()));
        assert_eq!(session.close().await, Ok(()));
        assert_eq!(driver.count(CallKind::Close), 1);
        assert!(session.active_handle().is_none());
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let (session, driver) = session(MockDriver::new());
        assert_eq!(session.close().await, Ok(()));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_close_still_forgets_handle() {
        let (session, driver) = session(MockDriver::new().fail_close(5));
        session.open(&descriptor()).await.unwrap();

        assert_eq!(session.close().await, Err(DriverError::CloseFailed(5)));
        assert!(session.is_released());
        assert_eq!(session.close().await, Ok(()));
        assert_eq!(driver.count(CallKind::Close), 1);
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let (session, _) = session(MockDriver::new());
        let first = session.open(&descriptor()).await.unwrap();
        session.close().await.unwrap();
        let second = session.open(&descriptor()).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_commit_with_stale_handle_never_reaches_driver() {
        let (session, driver) = session(MockDriver::new());
        let handle = session.open(&descriptor()).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(session.commit(handle).await, Err(DriverError::NotOpen));
        assert_eq!(driver.count(CallKind::Commit), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_code() {
        let (session, _) = session(MockDriver::new().fail_commit(4));
        let handle = session.open(&descriptor()).await.unwrap();
        assert_eq!(
            session.commit(handle).await,
            Err(DriverError::CommitFailed(4))
        );
        // commit failure does not release the session by itself
        assert_eq!(session.active_handle(), Some(handle));
    }

    #[tokio::test]
    async fn test_close_during_open_abandons_it() {
        let (session, driver) = session(
            MockDriver::new().stall_on(CallKind::Open, Duration::from_millis(150)),
        );
        let opener = session.clone();
        let open = tokio::spawn(async move { opener.open(&descriptor()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.close().await, Ok(()));

        assert_eq!(open.await.unwrap(), Err(DriverError::Abandoned));
        assert!(session.is_released());
        assert_eq!(
            driver.call_kinds(),
            vec![CallKind::Open, CallKind::Close]
        );
    }

    #[tokio::test]
    async fn test_wait_released_follows_late_open() {
        let (session, driver) = session_with_timeout(
            MockDriver::new().stall_on(CallKind::Open, Duration::from_millis(120)),
            Duration::from_millis(30),
        );

        assert_eq!(session.open(&descriptor()).await, Err(DriverError::Timeout));
        session.close().await.unwrap();
        assert!(!session.is_released());
        assert!(!session.wait_released(Duration::from_millis(10)).await);

        assert!(session.wait_released(Duration::from_millis(500)).await);
        // the late handle is closed before the slot reads as released
        assert_eq!(driver.call_kinds(), vec![CallKind::Open, CallKind::Close]);
    }

    #[tokio::test]
    async fn test_wait_released_when_already_empty() {
        let (session, _) = session(MockDriver::new());
        assert!(session.wait_released(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_timed_out_open_is_closed_by_next_close() {
        let (session, driver) = session_with_timeout(
            MockDriver::new().stall_on(CallKind::Open, Duration::from_millis(120)),
            Duration::from_millis(30),
        );

        assert_eq!(session.open(&descriptor()).await, Err(DriverError::Timeout));
        assert_eq!(session.close().await, Ok(()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.is_released());
        assert_eq!(driver.count(CallKind::Close), 1);
    }
}
