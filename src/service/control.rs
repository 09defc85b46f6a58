use super::{ServiceComponent, ServiceError, ServiceStatus};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action.await).is_err() {
            error!("Failed to send control response");
        }
    };
}

/// Commands accepted by the control worker.
#[derive(Debug)]
pub enum ControlAction {
    Start {
        response_tx: oneshot::Sender<Result<(), ServiceError>>,
    },
    Stop {
        response_tx: oneshot::Sender<Result<(), ServiceError>>,
    },
    Restart {
        response_tx: oneshot::Sender<Result<(), ServiceError>>,
    },
    Status {
        response_tx: oneshot::Sender<ServiceStatus>,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control worker is not running")]
    WorkerGone,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Cloneable front end of the control worker.
///
/// Commands are handled one at a time, so a `stop` never overlaps a `start`.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    tx: Sender<ControlAction>,
}

impl ControlHandle {
    pub async fn start(&self) -> Result<(), ControlError> {
        let (response_tx, rx) = oneshot::channel();
        self.send(ControlAction::Start { response_tx }).await?;
        rx.await.map_err(|_| ControlError::WorkerGone)??;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        let (response_tx, rx) = oneshot::channel();
        self.send(ControlAction::Stop { response_tx }).await?;
        rx.await.map_err(|_| ControlError::WorkerGone)??;
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), ControlError> {
        let (response_tx, rx) = oneshot::channel();
        self.send(ControlAction::Restart { response_tx }).await?;
        rx.await.map_err(|_| ControlError::WorkerGone)??;
        Ok(())
    }

    pub async fn status(&self) -> Result<ServiceStatus, ControlError> {
        let (response_tx, rx) = oneshot::channel();
        self.send(ControlAction::Status { response_tx }).await?;
        rx.await.map_err(|_| ControlError::WorkerGone)
    }

    async fn send(&self, action: ControlAction) -> Result<(), ControlError> {
        self.tx
            .send(action)
            .await
            .map_err(|_| ControlError::WorkerGone)
    }
}

/// Moves `component` onto a worker task driven by [`ControlHandle`] commands.
///
/// When every handle is dropped the worker stops the component and exits.
pub fn spawn_control_worker(
    mut component: Box<dyn ServiceComponent>,
) -> (ControlHandle, JoinHandle<()>) {
    let (tx, mut rx) = channel::<ControlAction>(16);
    let worker = tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            match action {
                ControlAction::Start { response_tx } => {
                    handle_action!(component.start(), response_tx);
                }
                ControlAction::Stop { response_tx } => {
                    handle_action!(component.stop(), response_tx);
                }
                ControlAction::Restart { response_tx } => {
                    info!("Restarting {}", component.name());
                    handle_action!(component.restart(), response_tx);
                }
                ControlAction::Status { response_tx } => {
                    handle_action!(component.status(), response_tx);
                }
            }
        }

        if let Err(e) = component.stop().await {
            error!("Failed to stop {} on shutdown: {}", component.name(), e);
        }
        info!("Control worker for {} exited", component.name());
    });

    (ControlHandle { tx }, worker)
}
