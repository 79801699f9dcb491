//! Composition of controllers into one runnable unit.

use crate::controller::InformerController;
use async_trait::async_trait;
use opkit_core::BoxError;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A long-running unit of control logic the [`Operator`] can drive.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Run until `ct` is cancelled or a fatal error occurs
    async fn run(&self, ct: CancellationToken) -> Result<(), BoxError>;

    /// Whether the controller considers itself ready to serve
    fn healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl Controller for InformerController {
    async fn run(&self, ct: CancellationToken) -> Result<(), BoxError> {
        InformerController::run(self, ct).await;
        Ok(())
    }

    fn healthy(&self) -> bool {
        InformerController::healthy(self)
    }
}

/// Runs a set of controllers, propagating shutdown and health.
///
/// All controllers start together; the first fatal controller error cancels
/// the rest and is returned. Cancellation of the provided token shuts
/// everything down gracefully and returns `Ok`.
#[derive(Default)]
pub struct Operator {
    controllers: Vec<Arc<dyn Controller>>,
}

impl Operator {
    /// An operator with no controllers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller to the run set
    pub fn add_controller(&mut self, controller: Arc<dyn Controller>) {
        self.controllers.push(controller);
    }

    /// Number of registered controllers
    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Whether every registered controller reports healthy
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.controllers.iter().all(|controller| controller.healthy())
    }

    /// Run every controller until `ct` is cancelled or one fails
    pub async fn run(&self, ct: CancellationToken) -> Result<(), BoxError> {
        let child = ct.child_token();
        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        for controller in &self.controllers {
            let controller = Arc::clone(controller);
            let ct = child.clone();
            tasks.spawn(async move { controller.run(ct).await });
        }

        let mut first_error = None;
        let mut shutting_down = false;
        loop {
            tokio::select! {
                () = ct.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    child.cancel();
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        error!(error = %err, "controller failed, shutting down operator");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        shutting_down = true;
                        child.cancel();
                    }
                    Some(Err(join_err)) => {
                        error!(error = %join_err, "controller task panicked, shutting down operator");
                        if first_error.is_none() {
                            first_error = Some(Box::new(join_err));
                        }
                        shutting_down = true;
                        child.cancel();
                    }
                    None => break,
                },
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
