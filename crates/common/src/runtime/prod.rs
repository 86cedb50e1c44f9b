//! Production implementation of the Runtime trait, backed by tokio.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use anyhow::Context;
use futures::{
    future::FusedFuture,
    FutureExt,
    TryFutureExt,
};
use rand::rngs::ThreadRng;
use tracing::Instrument;

use crate::runtime::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(JoinError::from).boxed()
    }
}

impl FutureHandle {
    pub(crate) fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }
}

#[derive(Clone)]
pub struct ProdRuntime {
    handle: tokio::runtime::Handle,
}

impl ProdRuntime {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// The runtime of the calling context. Fails outside of a tokio runtime.
    pub fn current() -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .context("ProdRuntime::current() called outside a tokio runtime")?;
        Ok(Self { handle })
    }
}

impl Runtime for ProdRuntime {
    type Handle = FutureHandle;
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        let span = tracing::info_span!("task", name);
        FutureHandle::new(self.handle.spawn(f.instrument(span)))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut rand::rng())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::runtime::{
        prod::ProdRuntime,
        shutdown_and_join,
        Runtime,
        WithTimeout,
    };

    #[tokio::test]
    async fn test_spawn_and_join() -> anyhow::Result<()> {
        let rt = ProdRuntime::current()?;
        let handle = rt.spawn("unit_test", async {});
        shutdown_and_join(handle).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_with_timeout_expires() -> anyhow::Result<()> {
        let rt = ProdRuntime::current()?;
        let result: anyhow::Result<()> = rt
            .with_timeout("sleepy", Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_uuids_are_distinct() -> anyhow::Result<()> {
        let rt = ProdRuntime::current()?;
        assert_ne!(rt.new_uuid_v4(), rt.new_uuid_v4());
        Ok(())
    }
}
