//! The watcher contract and closure-based helpers.

use async_trait::async_trait;
use futures::future::BoxFuture;
use opkit_core::{BoxError, DynamicResource};
use std::sync::Arc;

/// Callback receiving handler failures for logging or metrics.
pub type ErrorHandler =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) + Send + Sync>;

/// The default error handler logs and moves on.
#[must_use]
pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|err| tracing::error!(error = %err, "handler failed"))
}

/// Handler with one callback per change kind and no result beyond an error.
#[async_trait]
pub trait ResourceWatcher: Send + Sync {
    /// An object appeared
    async fn add(&self, object: Arc<DynamicResource>) -> Result<(), BoxError>;

    /// An object changed
    async fn update(
        &self,
        old: Arc<DynamicResource>,
        new: Arc<DynamicResource>,
    ) -> Result<(), BoxError>;

    /// An object went away
    async fn delete(&self, object: Arc<DynamicResource>) -> Result<(), BoxError>;
}

type AddFn = Box<dyn Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type UpdateFn = Box<
    dyn Fn(Arc<DynamicResource>, Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;
type DeleteFn = Box<dyn Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// A [`ResourceWatcher`] assembled from closures; callbacks left unset are
/// no-ops.
#[derive(Default)]
pub struct SimpleWatcher {
    add_fn: Option<AddFn>,
    update_fn: Option<UpdateFn>,
    delete_fn: Option<DeleteFn>,
}

impl SimpleWatcher {
    /// A watcher that ignores everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the add callback
    #[must_use]
    pub fn on_add<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static,
    {
        self.add_fn = Some(Box::new(f));
        self
    }

    /// Set the update callback
    #[must_use]
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<DynamicResource>, Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.update_fn = Some(Box::new(f));
        self
    }

    /// Set the delete callback
    #[must_use]
    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static,
    {
        self.delete_fn = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl ResourceWatcher for SimpleWatcher {
    async fn add(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        match &self.add_fn {
            Some(f) => f(object).await,
            None => Ok(()),
        }
    }

    async fn update(
        &self,
        old: Arc<DynamicResource>,
        new: Arc<DynamicResource>,
    ) -> Result<(), BoxError> {
        match &self.update_fn {
            Some(f) => f(old, new).await,
            None => Ok(()),
        }
    }

    async fn delete(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        match &self.delete_fn {
            Some(f) => f(object).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use opkit_core::GroupVersionKind;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn unset_callbacks_are_noops() {
        let watcher = SimpleWatcher::new();
        let obj = Arc::new(DynamicResource::new(
            "o",
            &GroupVersionKind::gvk("example.io", "v1", "Widget"),
        ));
        assert!(watcher.add(Arc::clone(&obj)).await.is_ok());
        assert!(watcher.update(Arc::clone(&obj), Arc::clone(&obj)).await.is_ok());
        assert!(watcher.delete(obj).await.is_ok());
    }

    #[tokio::test]
    async fn set_callbacks_are_invoked() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let watcher = SimpleWatcher::new().on_add(move |obj| {
            let record = Arc::clone(&record);
            async move {
                record.lock().push(obj.name().to_string());
                Ok(())
            }
            .boxed()
        });
        let obj = Arc::new(DynamicResource::new(
            "o1",
            &GroupVersionKind::gvk("example.io", "v1", "Widget"),
        ));
        watcher.add(obj).await.unwrap();
        assert_eq!(*seen.lock(), vec!["o1"]);
    }
}
