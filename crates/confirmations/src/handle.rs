use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::ads::{AdEvent, CreativeAd};
use crate::error::{ConfirmationsError, Result};
use crate::issuers::Issuers;
use crate::service::{Cancellation, Confirmations, ConfirmationsStatus};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Confirm {
        event: AdEvent,
        ad: CreativeAd,
        reply: oneshot::Sender<Result<String>>,
    },
    EligibleAds {
        candidates: Vec<CreativeAd>,
        last_served: Option<CreativeAd>,
        reply: oneshot::Sender<Result<Vec<CreativeAd>>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<Cancellation>>,
    },
    SetIssuers {
        issuers: Issuers,
        reply: oneshot::Sender<()>,
    },
    ProcessDue {
        reply: oneshot::Sender<Result<usize>>,
    },
    Status {
        reply: oneshot::Sender<Result<ConfirmationsStatus>>,
    },
}

/// Cloneable front door to a service running on its own task. Every call is queued
/// behind the ones before it.
#[derive(Clone)]
pub struct ConfirmationsHandle {
    commands: mpsc::Sender<Command>,
}

impl Confirmations {
    /// Moves the service onto a task that serves handle calls and runs `process_due`
    /// every tick. The task ends once every handle is dropped.
    pub fn spawn(self) -> (ConfirmationsHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run(self, receiver));
        (ConfirmationsHandle { commands }, task)
    }
}

async fn run(mut service: Confirmations, mut commands: mpsc::Receiver<Command>) {
    let mut ticker = tokio::time::interval(service.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Confirmations task started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => dispatch(&mut service, command).await,
                None => break,
            },
            _ = ticker.tick() => {
                match service.process_due().await {
                    Ok(0) => {}
                    Ok(attempts) => debug!("Made {} redemption attempts", attempts),
                    Err(e) => error!("Processing due redemptions failed: {}", e),
                }
            }
        }
    }

    info!("Confirmations task stopped");
}

async fn dispatch(service: &mut Confirmations, command: Command) {
    // a dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Confirm { event, ad, reply } => {
            let _ = reply.send(service.confirm(event, &ad).await);
        }
        Command::EligibleAds {
            candidates,
            last_served,
            reply,
        } => {
            let _ = reply.send(service.eligible_ads(&candidates, last_served.as_ref()).await);
        }
        Command::Cancel { id, reply } => {
            let _ = reply.send(service.cancel(&id).await);
        }
        Command::SetIssuers { issuers, reply } => {
            service.set_issuers(issuers);
            let _ = reply.send(());
        }
        Command::ProcessDue { reply } => {
            let _ = reply.send(service.process_due().await);
        }
        Command::Status { reply } => {
            let _ = reply.send(service.status().await);
        }
    }
}

impl ConfirmationsHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ConfirmationsError::ServiceStopped)?;
        response.await.map_err(|_| ConfirmationsError::ServiceStopped)
    }

    pub async fn confirm(&self, event: AdEvent, ad: CreativeAd) -> Result<String> {
        self.call(|reply| Command::Confirm { event, ad, reply }).await?
    }

    pub async fn eligible_ads(
        &self,
        candidates: Vec<CreativeAd>,
        last_served: Option<CreativeAd>,
    ) -> Result<Vec<CreativeAd>> {
        self.call(|reply| Command::EligibleAds {
            candidates,
            last_served,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, id: impl Into<String>) -> Result<Cancellation> {
        let id = id.into();
        self.call(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn set_issuers(&self, issuers: Issuers) -> Result<()> {
        self.call(|reply| Command::SetIssuers { issuers, reply }).await
    }

    /// Runs due work now instead of waiting for the next tick
    pub async fn process_due(&self) -> Result<usize> {
        self.call(|reply| Command::ProcessDue { reply }).await?
    }

    pub async fn status(&self) -> Result<ConfirmationsStatus> {
        self.call(|reply| Command::Status { reply }).await?
    }
}
