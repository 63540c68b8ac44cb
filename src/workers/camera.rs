//! Camera worker: exposures, filter wheel, cooler
//!
//! The camera is the most contended device (science, calibration and
//! focus-test exposures plus cooler control); its single FIFO queue is
//! what keeps those from interleaving mid-exposure.

use super::{connect_driver, run_op, Completion, Reply, WorkerCore, WorkerFlags};
use crate::drivers::{CameraDriver, ExposureRequest, Frame};
use crate::error::DeviceError;
use tokio::sync::{mpsc, oneshot};

pub enum CameraCommand {
    Expose {
        request: ExposureRequest,
        reply: Reply<Frame>,
    },
    SetFilter {
        slot: u8,
        reply: Reply<()>,
    },
    SetCooler {
        on: bool,
        setpoint_c: f64,
        reply: Reply<()>,
    },
    SensorTemperature {
        reply: Reply<f64>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Stop,
}

#[derive(Clone)]
pub struct Camera {
    core: WorkerCore<CameraCommand>,
}

impl Camera {
    pub fn spawn(driver: Box<dyn CameraDriver>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let flags = WorkerFlags::new();
        tokio::spawn(run(driver, rx, flags.clone()));
        Self {
            core: WorkerCore::new("camera", tx, flags),
        }
    }

    pub fn flags(&self) -> WorkerFlags {
        self.core.flags()
    }

    pub fn is_live(&self) -> bool {
        self.core.is_live()
    }

    pub fn is_crashed(&self) -> bool {
        self.core.is_crashed()
    }

    pub fn mark_crashed(&self) {
        self.core.mark_crashed();
    }

    pub async fn expose(&self, request: ExposureRequest) -> Result<Completion<Frame>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(CameraCommand::Expose { request, reply })
            .await?;
        Ok(Completion::new(rx, "camera", "expose"))
    }

    pub async fn set_filter(&self, slot: u8) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(CameraCommand::SetFilter { slot, reply })
            .await?;
        Ok(Completion::new(rx, "camera", "set_filter"))
    }

    pub async fn set_cooler(
        &self,
        on: bool,
        setpoint_c: f64,
    ) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(CameraCommand::SetCooler {
                on,
                setpoint_c,
                reply,
            })
            .await?;
        Ok(Completion::new(rx, "camera", "set_cooler"))
    }

    pub async fn sensor_temperature(&self) -> Result<Completion<f64>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(CameraCommand::SensorTemperature { reply })
            .await?;
        Ok(Completion::new(rx, "camera", "sensor_temperature"))
    }

    /// Disconnect then stop; pending commands flush first.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .core
            .enqueue(CameraCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = self.core.enqueue(CameraCommand::Stop).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(30), rx).await;
        }
    }

    /// Ask the worker task to exit without disconnecting; used when
    /// discarding a crashed worker.
    pub async fn stop(&self) {
        let _ = self.core.enqueue(CameraCommand::Stop).await;
    }
}

async fn run(
    driver: Box<dyn CameraDriver>,
    mut rx: mpsc::Receiver<CameraCommand>,
    flags: WorkerFlags,
) {
    connect_driver(&flags, "camera", driver.connect()).await;

    while let Some(command) = rx.recv().await {
        match command {
            CameraCommand::Expose { request, reply } => {
                let result = run_op(&flags, "camera", "expose", driver.expose(&request)).await;
                let _ = reply.send(result);
            }
            CameraCommand::SetFilter { slot, reply } => {
                let result =
                    run_op(&flags, "camera", "set_filter", driver.set_filter_slot(slot)).await;
                let _ = reply.send(result);
            }
            CameraCommand::SetCooler {
                on,
                setpoint_c,
                reply,
            } => {
                let result = run_op(
                    &flags,
                    "camera",
                    "set_cooler",
                    driver.set_cooler(on, setpoint_c),
                )
                .await;
                let _ = reply.send(result);
            }
            CameraCommand::SensorTemperature { reply } => {
                let result = run_op(
                    &flags,
                    "camera",
                    "sensor_temperature",
                    driver.sensor_temperature(),
                )
                .await;
                let _ = reply.send(result);
            }
            CameraCommand::Disconnect { reply } => {
                let result = match driver.disconnect().await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(DeviceError::CommandFailed {
                        device: "camera".into(),
                        operation: "disconnect".into(),
                        message: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            CameraCommand::Stop => break,
        }
    }

    flags.set_stopped();
    tracing::debug!("camera worker stopped");
}
