//! Single-flight de-duplication of idempotent device queries.
//!
//! A [`ResponseShare`] wraps a producer (typically "send a batch and parse
//! the reply"). Concurrent callers in the same round await one shared
//! invocation; once it settles, the next caller starts a new round.
//!
//! ```rust
//! use serial_proxy::share::ResponseShare;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let calls = Arc::new(AtomicU32::new(0));
//! let counter = Arc::clone(&calls);
//! let share: ResponseShare<u32, String> = ResponseShare::new(move || {
//!     let counter = Arc::clone(&counter);
//!     async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
//! });
//! let (a, b) = futures::join!(share.execute(), share.execute());
//! assert_eq!(a, b);
//! # }
//! ```

use crate::error::SerialError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

type Producer<T, E> = Box<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct Round<T, E> {
    generation: u64,
    future: Shared<BoxFuture<'static, Result<T, E>>>,
}

struct Slot<T, E> {
    generation: u64,
    pending: Option<Round<T, E>>,
}

/// Shares one in-flight producer invocation among concurrent callers.
pub struct ResponseShare<T, E = SerialError> {
    producer: Producer<T, E>,
    slot: Arc<Mutex<Slot<T, E>>>,
}

impl<T, E> std::fmt::Debug for ResponseShare<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("ResponseShare")
            .field("generation", &slot.generation)
            .field("pending", &slot.pending.is_some())
            .finish()
    }
}

impl<T, E> ResponseShare<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wrap `producer`; it is called once per round.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            producer: Box::new(move || producer().boxed()),
            slot: Arc::new(Mutex::new(Slot {
                generation: 0,
                pending: None,
            })),
        }
    }

    /// Join the pending round, or start a new one.
    pub async fn execute(&self) -> Result<T, E> {
        let future = {
            let mut slot = self.slot.lock();
            // a settled round that has not cleared itself yet counts as gone
            let joined = slot
                .pending
                .as_ref()
                .filter(|round| round.future.peek().is_none())
                .map(|round| round.future.clone());
            match joined {
                Some(future) => future,
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let future = self.start(generation);
                    slot.pending = Some(Round {
                        generation,
                        future: future.clone(),
                    });
                    tracing::trace!(generation, "Started shared request");
                    future
                }
            }
        };
        future.await
    }

    fn start(&self, generation: u64) -> Shared<BoxFuture<'static, Result<T, E>>> {
        let produce = (self.producer)();
        let slot = Arc::clone(&self.slot);
        async move {
            let result = produce.await;
            let mut slot = slot.lock();
            if slot.pending.as_ref().map(|r| r.generation) == Some(generation) {
                slot.pending = None;
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Number of rounds started so far.
    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// True while a round is in flight.
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .pending
            .as_ref()
            .is_some_and(|r| r.future.peek().is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_share(delay: Duration) -> (ResponseShare<u32, String>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let share = ResponseShare::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(delay).await;
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }
        });
        (share, calls)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_invocation() {
        let (share, calls) = counting_share(Duration::from_millis(20));

        let first = join_all((0..10).map(|_| share.execute())).await;
        assert!(first.iter().all(|r| *r == Ok(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!share.is_pending());

        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = join_all((0..10).map(|_| share.execute())).await;
        assert!(second.iter().all(|r| *r == Ok(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(share.generation(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_round_restarts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let share: ResponseShare<u32, String> = ResponseShare::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if n == 0 {
                    Err("device busy".to_string())
                } else {
                    Ok(n)
                }
            }
        });

        let failed = join_all((0..3).map(|_| share.execute())).await;
        assert!(failed
            .iter()
            .all(|r| matches!(r, Err(e) if e == "device busy")));

        assert_eq!(share.execute().await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sequential_callers_each_start_a_round() {
        let (share, calls) = counting_share(Duration::from_millis(1));
        assert_eq!(share.execute().await, Ok(0));
        assert_eq!(share.execute().await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
