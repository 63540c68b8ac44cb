//! Telescope mount worker

use super::{connect_driver, run_op, Completion, Reply, WorkerCore, WorkerFlags};
use crate::drivers::TelescopeDriver;
use crate::error::DeviceError;
use tokio::sync::{mpsc, oneshot};

pub enum TelescopeCommand {
    Slew {
        ra_hours: f64,
        dec_degrees: f64,
        reply: Reply<()>,
    },
    Jog {
        ra_arcsec: f64,
        dec_arcsec: f64,
        reply: Reply<()>,
    },
    Park {
        reply: Reply<()>,
    },
    Unpark {
        reply: Reply<()>,
    },
    Coordinates {
        reply: Reply<(f64, f64)>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Stop,
}

#[derive(Clone)]
pub struct Telescope {
    core: WorkerCore<TelescopeCommand>,
}

impl Telescope {
    pub fn spawn(driver: Box<dyn TelescopeDriver>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let flags = WorkerFlags::new();
        tokio::spawn(run(driver, rx, flags.clone()));
        Self {
            core: WorkerCore::new("telescope", tx, flags),
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

    pub async fn slew(
        &self,
        ra_hours: f64,
        dec_degrees: f64,
    ) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(TelescopeCommand::Slew {
                ra_hours,
                dec_degrees,
                reply,
            })
            .await?;
        Ok(Completion::new(rx, "telescope", "slew"))
    }

    pub async fn jog(
        &self,
        ra_arcsec: f64,
        dec_arcsec: f64,
    ) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(TelescopeCommand::Jog {
                ra_arcsec,
                dec_arcsec,
                reply,
            })
            .await?;
        Ok(Completion::new(rx, "telescope", "jog"))
    }

    pub async fn park(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core.enqueue(TelescopeCommand::Park { reply }).await?;
        Ok(Completion::new(rx, "telescope", "park"))
    }

    pub async fn unpark(&self) -> Result<Completion<()>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(TelescopeCommand::Unpark { reply })
            .await?;
        Ok(Completion::new(rx, "telescope", "unpark"))
    }

    pub async fn coordinates(&self) -> Result<Completion<(f64, f64)>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.core
            .enqueue(TelescopeCommand::Coordinates { reply })
            .await?;
        Ok(Completion::new(rx, "telescope", "coordinates"))
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .core
            .enqueue(TelescopeCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = self.core.enqueue(TelescopeCommand::Stop).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(30), rx).await;
        }
    }

    pub async fn stop(&self) {
        let _ = self.core.enqueue(TelescopeCommand::Stop).await;
    }
}

async fn run(
    driver: Box<dyn TelescopeDriver>,
    mut rx: mpsc::Receiver<TelescopeCommand>,
    flags: WorkerFlags,
) {
    connect_driver(&flags, "telescope", driver.connect()).await;

    while let Some(command) = rx.recv().await {
        match command {
            TelescopeCommand::Slew {
                ra_hours,
                dec_degrees,
                reply,
            } => {
                let result = run_op(
                    &flags,
                    "telescope",
                    "slew",
                    driver.slew(ra_hours, dec_degrees),
                )
                .await;
                let _ = reply.send(result);
            }
            TelescopeCommand::Jog {
                ra_arcsec,
                dec_arcsec,
                reply,
            } => {
                let result = run_op(
                    &flags,
                    "telescope",
                    "jog",
                    driver.jog(ra_arcsec, dec_arcsec),
                )
                .await;
                let _ = reply.send(result);
            }
            TelescopeCommand::Park { reply } => {
                let result = run_op(&flags, "telescope", "park", driver.park()).await;
                let _ = reply.send(result);
            }
            TelescopeCommand::Unpark { reply } => {
                let result = run_op(&flags, "telescope", "unpark", driver.unpark()).await;
                let _ = reply.send(result);
            }
            TelescopeCommand::Coordinates { reply } => {
                let result =
                    run_op(&flags, "telescope", "coordinates", driver.coordinates()).await;
                let _ = reply.send(result);
            }
            TelescopeCommand::Disconnect { reply } => {
                let result = match driver.disconnect().await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(DeviceError::CommandFailed {
                        device: "telescope".into(),
                        operation: "disconnect".into(),
                        message: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            TelescopeCommand::Stop => break,
        }
    }

    flags.set_stopped();
    tracing::debug!("telescope worker stopped");
}
