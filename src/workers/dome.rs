//! Dome worker

use super::{connect_driver, run_op, Completion, Reply, WorkerCore, WorkerFlags};
use crate::drivers::{DomeDriver, ShutterState};
use crate::error::DeviceError;
use tokio::sync::{mpsc, oneshot};

pub enum DomeCommand {
    OpenShutter { reply: Reply<()> },
    CloseShutter { reply: Reply<()> },
    ShutterState { reply: Reply<ShutterState> },
    Home { reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    Stop,
}

#[derive(Clone)]
pub struct Dome {
    core: WorkerCore<DomeCommand>,
}

impl Dome {
    pub fn spawn(driver: Box<dyn DomeDriver>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let flags = WorkerFlags::new();
        tokio::spawn(run(driver, rx, flags.clone()));
        Self {
            core: WorkerCore::new("dome", tx, flags),
        }
    }

    pub fn flags(&self) -> WorkerFlags {
        self.core.flags()
    }

    pub fn is_live(&self) -> bool {
        self.core.is_live()
    }

    pub fn mark_crashed(&self) {
        self.core.mark_crashed();
    }

    pub async fn open_shutter(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(DomeCommand::OpenShutter { reply })
            .await?;
        Ok(Completion::new(rx, "dome", "open_shutter"))
    }

    pub async fn close_shutter(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(DomeCommand::CloseShutter { reply })
            .await?;
        Ok(Completion::new(rx, "dome", "close_shutter"))
    }

    pub async fn shutter_state(&self) -> Result<Completion<ShutterState>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(DomeCommand::ShutterState { reply })
            .await?;
        Ok(Completion::new(rx, "dome", "shutter_state"))
    }

    pub async fn home(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core.enqueue(DomeCommand::Home { reply }).await?;
        Ok(Completion::new(rx, "dome", "home"))
    }

    /// Disconnect then stop. The wait here is deliberately unbounded:
    /// any queued shutter-close must finish before the dome goes away.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .core
            .enqueue(DomeCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = self.core.enqueue(DomeCommand::Stop).await;
            let _ = Completion::new(rx, "dome", "disconnect").join().await;
        }
    }

    pub async fn stop(&self) {
        let _ = self.core.enqueue(DomeCommand::Stop).await;
    }
}

async fn run(driver: Box<dyn DomeDriver>, mut rx: mpsc::Receiver<DomeCommand>, flags: WorkerFlags) {
    connect_driver(&flags, "dome", driver.connect()).await;

    while let Some(command) = rx.recv().await {
        match command {
            DomeCommand::OpenShutter { reply } => {
                let result = run_op(&flags, "dome", "open_shutter", driver.open_shutter()).await;
                let _ = reply.send(result);
            }
            DomeCommand::CloseShutter { reply } => {
                let result = run_op(&flags, "dome", "close_shutter", driver.close_shutter()).await;
                let _ = reply.send(result);
            }
            DomeCommand::ShutterState { reply } => {
                let result = run_op(&flags, "dome", "shutter_state", driver.shutter_state()).await;
                let _ = reply.send(result);
            }
            DomeCommand::Home { reply } => {
                let result = run_op(&flags, "dome", "home", driver.home()).await;
                let _ = reply.send(result);
            }
            DomeCommand::Disconnect { reply } => {
                let result = match driver.disconnect().await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(DeviceError::CommandFailed {
                        device: "dome".into(),
                        operation: "disconnect".into(),
                        message: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            DomeCommand::Stop => break,
        }
    }

    flags.set_stopped();
    tracing::debug!("dome worker stopped");
}
