//! Hardware workers
//!
//! One tokio task per physical device, owning the driver and a FIFO
//! command queue. Callers enqueue commands (never blocking beyond queue
//! insertion) and synchronize on per-command completions with bounded
//! waits. All device I/O happens on the owning worker's task, so commands
//! to a given device cannot interleave.

pub mod camera;
pub mod dome;
pub mod focuser;
pub mod lamp;
pub mod telescope;

pub use camera::Camera;
pub use dome::Dome;
pub use focuser::Focuser;
pub use lamp::Lamp;
pub use telescope::Telescope;

use crate::drivers::{DriverError, DriverFactory, DriverResult};
use crate::error::DeviceError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, DeviceError>>;

/// Shared status flags of one worker.
///
/// `live` is set once the hardware handshake succeeds and never again;
/// `crashed` marks a driver fault needing worker replacement; `running`
/// clears when the worker task exits.
#[derive(Clone)]
pub struct WorkerFlags {
    live: Arc<AtomicBool>,
    crashed: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl WorkerFlags {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(false)),
            crashed: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for WorkerFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a bounded wait on a command completion.
#[derive(Debug)]
pub enum OpResult<T> {
    Done(T),
    Failed(DeviceError),
    TimedOut,
}

impl<T> OpResult<T> {
    /// Collapse into a Result, turning a timeout into a `DeviceError`.
    pub fn into_result(
        self,
        device: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<T, DeviceError> {
        match self {
            OpResult::Done(value) => Ok(value),
            OpResult::Failed(e) => Err(e),
            OpResult::TimedOut => Err(DeviceError::Timeout {
                device: device.to_string(),
                operation: operation.to_string(),
                timeout,
            }),
        }
    }
}

/// Completion signal for one enqueued command.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, DeviceError>>,
    device: &'static str,
    operation: &'static str,
}

impl<T> Completion<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<T, DeviceError>>,
        device: &'static str,
        operation: &'static str,
    ) -> Self {
        Self {
            rx,
            device,
            operation,
        }
    }

    /// Wait for the command to finish, at most `timeout`. A stuck device
    /// yields `TimedOut` rather than hanging the caller.
    pub async fn wait(self, timeout: Duration) -> OpResult<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => OpResult::TimedOut,
            Ok(Err(_)) => OpResult::Failed(DeviceError::QueueClosed {
                device: self.device.to_string(),
            }),
            Ok(Ok(Ok(value))) => OpResult::Done(value),
            Ok(Ok(Err(e))) => OpResult::Failed(e),
        }
    }

    /// Wait without a deadline. Only correct where blocking indefinitely
    /// is the desired safety behavior.
    pub async fn join(self) -> Result<T, DeviceError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::QueueClosed {
                device: self.device.to_string(),
            }),
        }
    }

    /// Collapse a bounded wait into a Result.
    pub async fn result(self, timeout: Duration) -> Result<T, DeviceError> {
        let device = self.device;
        let operation = self.operation;
        self.wait(timeout).await.into_result(device, operation, timeout)
    }
}

/// Command sender plus flags; the caller-side half of one worker.
pub struct WorkerCore<C> {
    name: &'static str,
    tx: mpsc::Sender<C>,
    flags: WorkerFlags,
}

impl<C> Clone for WorkerCore<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            flags: self.flags.clone(),
        }
    }
}

impl<C> WorkerCore<C> {
    pub(crate) fn new(name: &'static str, tx: mpsc::Sender<C>, flags: WorkerFlags) -> Self {
        Self { name, tx, flags }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> WorkerFlags {
        self.flags.clone()
    }

    pub fn is_live(&self) -> bool {
        self.flags.is_live()
    }

    pub fn is_crashed(&self) -> bool {
        self.flags.is_crashed()
    }

    pub fn mark_crashed(&self) {
        self.flags.mark_crashed();
    }

    pub(crate) async fn enqueue(&self, command: C) -> Result<(), DeviceError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DeviceError::QueueClosed {
                device: self.name.to_string(),
            })
    }
}

/// Execute one driver call on behalf of a worker, translating driver
/// errors and flagging faults for the monitor.
pub(crate) async fn run_op<T>(
    flags: &WorkerFlags,
    device: &'static str,
    operation: &'static str,
    op: impl Future<Output = DriverResult<T>>,
) -> Result<T, DeviceError> {
    if !flags.is_live() {
        return Err(DeviceError::NotConnected {
            device: device.to_string(),
        });
    }
    match op.await {
        Ok(value) => Ok(value),
        Err(DriverError::Command(message)) => Err(DeviceError::CommandFailed {
            device: device.to_string(),
            operation: operation.to_string(),
            message,
        }),
        Err(DriverError::Connection(message)) | Err(DriverError::Fault(message)) => {
            flags.mark_crashed();
            tracing::warn!("{device} driver fault during {operation}: {message}");
            Err(DeviceError::DriverFault {
                device: device.to_string(),
                message,
            })
        }
    }
}

/// Run the initial hardware handshake; `live` stays unset on failure and
/// the device must be treated as entirely unavailable.
pub(crate) async fn connect_driver(
    flags: &WorkerFlags,
    device: &'static str,
    op: impl Future<Output = DriverResult<()>>,
) {
    match op.await {
        Ok(()) => {
            flags.set_live();
            tracing::info!("{device} online");
        }
        Err(e) => {
            tracing::error!("{device} connection failed: {e}");
        }
    }
}

/// Poll a worker's live flag until it sets, the worker dies, or the
/// timeout passes.
pub async fn await_live(flags: &WorkerFlags, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if flags.is_live() {
            return true;
        }
        if !flags.is_running() {
            return false;
        }
        if tokio::time::Instant::now() >= deadline {
            return flags.is_live();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// The set of workers for one observatory, behind rebindable slots.
///
/// Dependents (guider, focus loops, monitor) fetch handles through here on
/// every use, so replacing a crashed worker rebinds them all at once.
pub struct Rig {
    camera: RwLock<Camera>,
    telescope: RwLock<Telescope>,
    dome: RwLock<Dome>,
    focuser: RwLock<Focuser>,
    lamp: RwLock<Lamp>,
}

impl Rig {
    pub fn from_factory(factory: &dyn DriverFactory) -> Self {
        Self {
            camera: RwLock::new(Camera::spawn(factory.camera())),
            telescope: RwLock::new(Telescope::spawn(factory.telescope())),
            dome: RwLock::new(Dome::spawn(factory.dome())),
            focuser: RwLock::new(Focuser::spawn(factory.focuser())),
            lamp: RwLock::new(Lamp::spawn(factory.lamp())),
        }
    }

    pub async fn camera(&self) -> Camera {
        self.camera.read().await.clone()
    }

    pub async fn telescope(&self) -> Telescope {
        self.telescope.read().await.clone()
    }

    pub async fn dome(&self) -> Dome {
        self.dome.read().await.clone()
    }

    pub async fn focuser(&self) -> Focuser {
        self.focuser.read().await.clone()
    }

    pub async fn lamp(&self) -> Lamp {
        self.lamp.read().await.clone()
    }

    pub async fn replace_camera(&self, replacement: Camera) {
        *self.camera.write().await = replacement;
    }

    pub async fn replace_telescope(&self, replacement: Telescope) {
        *self.telescope.write().await = replacement;
    }

    pub async fn replace_dome(&self, replacement: Dome) {
        *self.dome.write().await = replacement;
    }

    pub async fn replace_focuser(&self, replacement: Focuser) {
        *self.focuser.write().await = replacement;
    }

    pub async fn replace_lamp(&self, replacement: Lamp) {
        *self.lamp.write().await = replacement;
    }

    /// Flush and stop every worker: disconnect then stop, in queue order.
    pub async fn shutdown_all(&self) {
        self.camera().await.shutdown().await;
        self.telescope().await.shutdown().await;
        self.focuser().await.shutdown().await;
        self.lamp().await.shutdown().await;
        // Dome last: it is the final physical barrier
        self.dome().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ExposureKind, ExposureRequest};
    use crate::sim::SimObservatory;

    #[tokio::test]
    async fn exposure_round_trip() {
        let sim = SimObservatory::instant();
        let camera = Camera::spawn(sim.camera());
        assert!(await_live(&camera.flags(), Duration::from_secs(2)).await);

        let pending = camera
            .expose(ExposureRequest {
                seconds: 0.05,
                kind: ExposureKind::Light,
            })
            .await
            .unwrap();
        match pending.wait(Duration::from_secs(2)).await {
            OpResult::Done(frame) => assert_eq!(frame.exposure_secs, 0.05),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fault_sets_crashed_flag() {
        let sim = SimObservatory::instant();
        sim.state.fail_light_attempt(1);
        let camera = Camera::spawn(sim.camera());
        assert!(await_live(&camera.flags(), Duration::from_secs(2)).await);

        let pending = camera
            .expose(ExposureRequest {
                seconds: 0.05,
                kind: ExposureKind::Light,
            })
            .await
            .unwrap();
        match pending.wait(Duration::from_secs(2)).await {
            OpResult::Failed(DeviceError::DriverFault { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(camera.is_crashed());
    }

    #[tokio::test]
    async fn commands_execute_in_fifo_order() {
        let sim = SimObservatory::instant();
        let focuser = Focuser::spawn(sim.focuser());
        assert!(await_live(&focuser.flags(), Duration::from_secs(2)).await);

        let first = focuser.move_to(100).await.unwrap();
        let second = focuser.move_to(200).await.unwrap();
        let readback = focuser.position().await.unwrap();

        first.result(Duration::from_secs(2)).await.unwrap();
        second.result(Duration::from_secs(2)).await.unwrap();
        let position = readback.result(Duration::from_secs(2)).await.unwrap();
        assert_eq!(position, 200);
    }

    #[tokio::test]
    async fn failed_connection_leaves_device_unavailable() {
        let sim = SimObservatory::instant();
        sim.state
            .fail_focuser_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let focuser = Focuser::spawn(sim.focuser());
        assert!(!await_live(&focuser.flags(), Duration::from_millis(200)).await);

        let pending = focuser.position().await.unwrap();
        match pending.wait(Duration::from_secs(1)).await {
            OpResult::Failed(DeviceError::NotConnected { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_commands() {
        let sim = SimObservatory::instant();
        let focuser = Focuser::spawn(sim.focuser());
        assert!(await_live(&focuser.flags(), Duration::from_secs(2)).await);

        let moving = focuser.move_to(4321).await.unwrap();
        focuser.shutdown().await;

        moving.result(Duration::from_secs(2)).await.unwrap();
        assert_eq!(*sim.state.focuser_position.lock().unwrap(), 4321);
        // Worker task has exited
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!focuser.flags().is_running());
    }
}
