// Print job orchestration.
//
//   Idle -> EnumeratingDevices -> OpeningDevice -> Composing -> Committing
//        -> ClosingDevice -> Completed
//
// Any failure (or abandonment) still passes through ClosingDevice before
// settling in Failed, so no job outlives its handle. The run lease is held
// until the terminal state is published; a second run cannot start earlier.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compositor::{DrawCommand, SurfaceCompositor};
use crate::device_session::DeviceSession;
use crate::driver::DriverPort;
use crate::errors::{DriverError, PipelineError};
use crate::registry::{DeviceDescriptor, DeviceList, DeviceRegistry};
use crate::status::{JobReporter, StatusKind, StatusSink, Step};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    /// The first device in enumeration order.
    #[default]
    FirstEnumerated,
}

impl DeviceSelection {
    pub fn select<'a>(&self, devices: &'a DeviceList) -> Option<&'a DeviceDescriptor> {
        match self {
            DeviceSelection::FirstEnumerated => devices.first(),
        }
    }
}

/// What to print and where. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJobSpec {
    pub commands: Vec<DrawCommand>,
    #[serde(default)]
    pub selection: DeviceSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("No printer device available")]
    NoDeviceAvailable,

    #[error("Device enumeration failed: {0}")]
    EnumerationError(DriverError),

    #[error("Could not open device: {0}")]
    OpenError(DriverError),

    #[error("Draw command {index} failed: {error}")]
    ComposeError { index: usize, error: DriverError },

    #[error("Print commit failed: {0}")]
    CommitError(DriverError),

    #[error("Print job was cancelled")]
    Cancelled,
}

impl FailureReason {
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            FailureReason::EnumerationError(e)
            | FailureReason::OpenError(e)
            | FailureReason::CommitError(e)
            | FailureReason::ComposeError { error: e, .. } => Some(e),
            FailureReason::NoDeviceAvailable | FailureReason::Cancelled => None,
        }
    }

    pub fn driver_code(&self) -> Option<i32> {
        self.driver_error().and_then(DriverError::code)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::NoDeviceAvailable => "no_device_available",
            FailureReason::EnumerationError(_) => "enumeration_error",
            FailureReason::OpenError(_) => "open_error",
            FailureReason::ComposeError { .. } => "compose_error",
            FailureReason::CommitError(_) => "commit_error",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    EnumeratingDevices,
    OpeningDevice,
    Composing,
    Committing,
    ClosingDevice,
    Completed,
    Failed(FailureReason),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed(FailureReason),
}

impl JobOutcome {
    fn into_state(self) -> PipelineState {
        match self {
            JobOutcome::Completed => PipelineState::Completed,
            JobOutcome::Failed(reason) => PipelineState::Failed(reason),
        }
    }
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PrintPipeline {
    registry: DeviceRegistry,
    session: DeviceSession,
    compositor: SurfaceCompositor,
    sink: Arc<dyn StatusSink>,
    lease: Arc<Mutex<()>>,
    state: watch::Sender<PipelineState>,
}

impl PrintPipeline {
    pub fn new(port: DriverPort, sink: Arc<dyn StatusSink>) -> Self {
        let session = DeviceSession::new(port.clone());
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            registry: DeviceRegistry::new(port),
            compositor: SurfaceCompositor::new(session.clone()),
            session,
            sink,
            lease: Arc::new(Mutex::new(())),
            state,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// True while a run (including its cleanup) holds the pipeline, or while
    /// the device slot has not yet been released.
    pub fn is_busy(&self) -> bool {
        self.lease.try_lock().is_err() || !self.session.is_released()
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>, PipelineError> {
        let lease = Arc::clone(&self.lease)
            .try_lock_owned()
            .map_err(|_| PipelineError::Busy)?;
        if !self.session.is_released() {
            warn!("Device slot still occupied by an earlier open, refusing to start");
            return Err(PipelineError::Busy);
        }
        Ok(lease)
    }

    /// Spawns a run and returns a handle to follow or abandon it.
    pub fn start(self: &Arc<Self>, spec: PrintJobSpec) -> Result<PrintJob, PipelineError> {
        let lease = self.acquire()?;
        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let done = Arc::new(AtomicBool::new(false));

        let pipeline = Arc::clone(self);
        let (flag, finished) = (cancel.clone(), Arc::clone(&done));
        let task = tokio::spawn(async move {
            pipeline
                .run_leased(id, spec, flag, lease, &finished)
                .await
        });

        Ok(PrintJob {
            id,
            cancel,
            done,
            session: self.session.clone(),
            task: Some(task),
        })
    }

    /// Runs a job to completion on the current task.
    pub async fn run(
        &self,
        spec: PrintJobSpec,
        cancel: CancelFlag,
    ) -> Result<JobOutcome, PipelineError> {
        let lease = self.acquire()?;
        let done = AtomicBool::new(false);
        Ok(self
            .run_leased(Uuid::new_v4(), spec, cancel, lease, &done)
            .await)
    }

    async fn run_leased(
        &self,
        id: Uuid,
        spec: PrintJobSpec,
        cancel: CancelFlag,
        lease: OwnedMutexGuard<()>,
        done: &AtomicBool,
    ) -> JobOutcome {
        let reporter = JobReporter::new(Arc::clone(&self.sink), id);
        let guard = CleanupGuard::arm(self.session.clone(), lease);
        info!(
            "Print job {} started with {} draw command(s) on {}",
            id,
            spec.commands.len(),
            self.session.port().type_name()
        );

        let outcome = match self.drive(&spec, &cancel, &reporter).await {
            Ok(()) => JobOutcome::Completed,
            Err(reason) => {
                warn!("Print job {} failed: {}", id, reason);
                JobOutcome::Failed(reason)
            }
        };

        self.release(&reporter).await;

        match &outcome {
            JobOutcome::Completed => info!("Print job {} completed", id),
            JobOutcome::Failed(reason) => info!(
                "Print job {} finished as failed ({}), device released",
                id,
                reason.kind()
            ),
        }
        self.transition(&reporter, outcome.clone().into_state());
        reporter.emit(StatusKind::Finished {
            outcome: outcome.clone(),
        });

        // must be visible before the lease is released
        done.store(true, Ordering::SeqCst);
        guard.disarm();
        outcome
    }

    async fn drive(
        &self,
        spec: &PrintJobSpec,
        cancel: &CancelFlag,
        reporter: &JobReporter,
    ) -> Result<(), FailureReason> {
        checkpoint(cancel)?;
        self.transition(reporter, PipelineState::EnumeratingDevices);
        reporter.started(Step::EnumerateDevices);
        let devices = self.registry.list_devices().await.map_err(|e| {
            reporter.failed(Step::EnumerateDevices, &e);
            abandoned_or(cancel, FailureReason::EnumerationError(e))
        })?;
        let device = match spec.selection.select(&devices) {
            Some(device) => device.clone(),
            None => {
                reporter.failed(Step::EnumerateDevices, &DriverError::NoDeviceAvailable);
                return Err(FailureReason::NoDeviceAvailable);
            }
        };
        reporter.finished(Step::EnumerateDevices);
        info!("Selected printer '{}' ({})", device.name, device.description);
        reporter.emit(StatusKind::DeviceSelected {
            name: device.name.clone(),
            description: device.description.clone(),
        });

        checkpoint(cancel)?;
        self.transition(reporter, PipelineState::OpeningDevice);
        reporter.started(Step::OpenDevice);
        let handle = self.session.open(&device).await.map_err(|e| {
            reporter.failed(Step::OpenDevice, &e);
            abandoned_or(cancel, FailureReason::OpenError(e))
        })?;
        reporter.finished(Step::OpenDevice);

        self.transition(reporter, PipelineState::Composing);
        for (index, command) in spec.commands.iter().enumerate() {
            checkpoint(cancel)?;
            reporter.started(Step::Draw(index));
            self.compositor.apply(command, handle).await.map_err(|error| {
                reporter.failed(Step::Draw(index), &error);
                abandoned_or(cancel, FailureReason::ComposeError { index, error })
            })?;
            reporter.finished(Step::Draw(index));
        }

        checkpoint(cancel)?;
        self.transition(reporter, PipelineState::Committing);
        reporter.started(Step::Commit);
        self.session.commit(handle).await.map_err(|e| {
            reporter.failed(Step::Commit, &e);
            abandoned_or(cancel, FailureReason::CommitError(e))
        })?;
        reporter.finished(Step::Commit);

        Ok(())
    }

    /// Closes whatever this run left open. Safe when nothing is open.
    async fn release(&self, reporter: &JobReporter) {
        self.transition(reporter, PipelineState::ClosingDevice);
        reporter.started(Step::CloseDevice);
        match self.session.close().await {
            Ok(()) => reporter.finished(Step::CloseDevice),
            Err(e) => {
                warn!("Device cleanup reported an error: {}", e);
                reporter.failed(Step::CloseDevice, &e);
            }
        }

        // a timed-out open is still in the driver; hold the lease until it returns
        if !self.session.is_released() {
            let limit = self.session.port().call_timeout();
            info!("Waiting up to {:?} for an in-flight open to settle", limit);
            if !self.session.wait_released(limit).await {
                warn!("Device open has not returned; new runs stay refused until it does");
            }
        }
    }

    fn transition(&self, reporter: &JobReporter, state: PipelineState) {
        self.state.send_replace(state.clone());
        reporter.emit(StatusKind::StateChanged { state });
    }
}

fn checkpoint(cancel: &CancelFlag) -> Result<(), FailureReason> {
    if cancel.is_cancelled() {
        info!("Print job abandoned, moving to cleanup");
        return Err(FailureReason::Cancelled);
    }
    Ok(())
}

// A step that fails because the job was abandoned underneath it reports the
// abandonment rather than the side effect.
fn abandoned_or(cancel: &CancelFlag, reason: FailureReason) -> FailureReason {
    if cancel.is_cancelled() {
        FailureReason::Cancelled
    } else {
        reason
    }
}

/// Closes the session if a run is dropped before its own cleanup ran.
struct CleanupGuard {
    session: Option<DeviceSession>,
    lease: Option<OwnedMutexGuard<()>>,
}

impl CleanupGuard {
    fn arm(session: DeviceSession, lease: OwnedMutexGuard<()>) -> Self {
        Self {
            session: Some(session),
            lease: Some(lease),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let lease = self.lease.take();
        warn!("Print run dropped before cleanup, closing device in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!("Background device close failed: {}", e);
                    }
                    drop(lease);
                });
            }
            Err(_) => error!("No runtime available to close the device"),
        }
    }
}

/// A running print job.
///
/// Dropping the handle before the job finishes abandons it.
pub struct PrintJob {
    id: Uuid,
    cancel: CancelFlag,
    done: Arc<AtomicBool>,
    session: DeviceSession,
    task: Option<JoinHandle<JobOutcome>>,
}

impl PrintJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True once the run has released the device and the pipeline.
    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
            || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancels the job and closes the device right away. The run notices at
    /// its next step boundary and finishes as `Failed(Cancelled)`.
    pub async fn abandon(&self) {
        if self.is_finished() {
            return;
        }
        info!("Abandoning print job {}", self.id);
        self.cancel.cancel();
        if let Err(e) = self.session.close().await {
            warn!("Close during abandon of job {} failed: {}", self.id, e);
        }
    }

    pub async fn wait(&mut self) -> Result<JobOutcome, PipelineError> {
        let task = self.task.as_mut().ok_or(PipelineError::JobLost)?;
        let result = task.await;
        self.task = None;
        result.map_err(|e| {
            error!("Print job {} task failed: {}", self.id, e);
            PipelineError::JobLost
        })
    }
}

impl Drop for PrintJob {
    fn drop(&mut self) {
        if self.is_finished() {
            return;
        }
        warn!("Print job {} handle dropped while running, abandoning", self.id);
        self.cancel.cancel();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            runtime.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!("Close after dropped job failed: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for PrintJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintJob")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
