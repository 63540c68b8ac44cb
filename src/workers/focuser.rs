//! Focuser worker
//!
//! A focuser that never connects is non-fatal for the run: the
//! orchestrator disables focusing and carries on.

use super::{connect_driver, run_op, Completion, Reply, WorkerCore, WorkerFlags};
use crate::drivers::FocuserDriver;
use crate::error::DeviceError;
use tokio::sync::{mpsc, oneshot};

pub enum FocuserCommand {
    MoveTo { position: i32, reply: Reply<()> },
    MoveBy { delta: i32, reply: Reply<i32> },
    Position { reply: Reply<i32> },
    Temperature { reply: Reply<Option<f64>> },
    Disconnect { reply: Reply<()> },
    Stop,
}

#[derive(Clone)]
pub struct Focuser {
    core: WorkerCore<FocuserCommand>,
}

impl Focuser {
    pub fn spawn(driver: Box<dyn FocuserDriver>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let flags = WorkerFlags::new();
        tokio::spawn(run(driver, rx, flags.clone()));
        Self {
            core: WorkerCore::new("focuser", tx, flags),
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

    pub async fn move_to(&self, position: i32) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(FocuserCommand::MoveTo { position, reply })
            .await?;
        Ok(Completion::new(rx, "focuser", "move_to"))
    }

    /// Relative move; resolves against the position at execution time and
    /// completes with the new absolute position.
    pub async fn move_by(&self, delta: i32) -> Result<Completion<i32>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(FocuserCommand::MoveBy { delta, reply })
            .await?;
        Ok(Completion::new(rx, "focuser", "move_by"))
    }

    pub async fn position(&self) -> Result<Completion<i32>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(FocuserCommand::Position { reply })
            .await?;
        Ok(Completion::new(rx, "focuser", "position"))
    }

    pub async fn temperature(&self) -> Result<Completion<Option<f64>>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(FocuserCommand::Temperature { reply })
            .await?;
        Ok(Completion::new(rx, "focuser", "temperature"))
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .core
            .enqueue(FocuserCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = self.core.enqueue(FocuserCommand::Stop).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(30), rx).await;
        }
    }

    pub async fn stop(&self) {
        let _ = self.core.enqueue(FocuserCommand::Stop).await;
    }
}

async fn run(
    driver: Box<dyn FocuserDriver>,
    mut rx: mpsc::Receiver<FocuserCommand>,
    flags: WorkerFlags,
) {
    connect_driver(&flags, "focuser", driver.connect()).await;

    while let Some(command) = rx.recv().await {
        match command {
            FocuserCommand::MoveTo { position, reply } => {
                let result = run_op(&flags, "focuser", "move_to", driver.move_to(position)).await;
                let _ = reply.send(result);
            }
            FocuserCommand::MoveBy { delta, reply } => {
                let result = run_op(&flags, "focuser", "move_by", async {
                    let current = driver.position().await?;
                    let target = current + delta;
                    driver.move_to(target).await?;
                    Ok(target)
                })
                .await;
                let _ = reply.send(result);
            }
            FocuserCommand::Position { reply } => {
                let result = run_op(&flags, "focuser", "position", driver.position()).await;
                let _ = reply.send(result);
            }
            FocuserCommand::Temperature { reply } => {
                let result = run_op(&flags, "focuser", "temperature", driver.temperature()).await;
                let _ = reply.send(result);
            }
            FocuserCommand::Disconnect { reply } => {
                let result = match driver.disconnect().await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(DeviceError::CommandFailed {
                        device: "focuser".into(),
                        operation: "disconnect".into(),
                        message: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            FocuserCommand::Stop => break,
        }
    }

    flags.set_stopped();
    tracing::debug!("focuser worker stopped");
}
