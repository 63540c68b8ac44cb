//! Flat-field lamp worker

use super::{connect_driver, run_op, Completion, Reply, WorkerCore, WorkerFlags};
use crate::drivers::LampDriver;
use crate::error::DeviceError;
use tokio::sync::{mpsc, oneshot};

pub enum LampCommand {
    TurnOn { reply: Reply<()> },
    TurnOff { reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    Stop,
}

#[derive(Clone)]
pub struct Lamp {
    core: WorkerCore<LampCommand>,
}

impl Lamp {
    pub fn spawn(driver: Box<dyn LampDriver>) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let flags = WorkerFlags::new();
        tokio::spawn(run(driver, rx, flags.clone()));
        Self {
            core: WorkerCore::new("lamp", tx, flags),
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

    /// Completes when the lamp reports ready.
    pub async fn turn_on(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core.enqueue(LampCommand::TurnOn { reply }).await?;
        Ok(Completion::new(rx, "lamp", "turn_on"))
    }

    pub async fn turn_off(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core.enqueue(LampCommand::TurnOff { reply }).await?;
        Ok(Completion::new(rx, "lamp", "turn_off"))
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .core
            .enqueue(LampCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = self.core.enqueue(LampCommand::Stop).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(15), rx).await;
        }
    }

    pub async fn stop(&self) {
        let _ = self.core.enqueue(LampCommand::Stop).await;
    }
}

async fn run(driver: Box<dyn LampDriver>, mut rx: mpsc::Receiver<LampCommand>, flags: WorkerFlags) {
    connect_driver(&flags, "lamp", driver.connect()).await;

    while let Some(command) = rx.recv().await {
        match command {
            LampCommand::TurnOn { reply } => {
                let result = run_op(&flags, "lamp", "turn_on", driver.turn_on()).await;
                let _ = reply.send(result);
            }
            LampCommand::TurnOff { reply } => {
                let result = run_op(&flags, "lamp", "turn_off", driver.turn_off()).await;
                let _ = reply.send(result);
            }
            LampCommand::Disconnect { reply } => {
                let result = match driver.disconnect().await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(DeviceError::CommandFailed {
                        device: "lamp".into(),
                        operation: "disconnect".into(),
                        message: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            LampCommand::Stop => break,
        }
    }

    flags.set_stopped();
    tracing::debug!("lamp worker stopped");
}
