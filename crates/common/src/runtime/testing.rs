//! Test implementation of the Runtime trait: tokio-backed, but with a seeded
//! source of randomness so test failures reproduce.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::Instrument;

use crate::runtime::{
    prod::FutureHandle,
    Runtime,
};

#[derive(Clone)]
pub struct TestRuntime {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl TestRuntime {
    /// A test runtime with a fixed default seed. Must be constructed within a
    /// tokio runtime (eg under `#[tokio::test]`).
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }
}

impl Runtime for TestRuntime {
    type Handle = FutureHandle;
    type Rng = ChaCha8Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        let span = tracing::info_span!("test_task", name);
        FutureHandle::new(tokio::spawn(f.instrument(span)))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut self.rng.lock())
    }
}
