//! A one-shot cancellation signal shared between a supervisor and the tasks
//! it spawned.
//!
//! The `Trigger` side is owned by whoever decides when work must stop, every
//! `Tripwire` is a future which resolves once that decision was made. A
//! `Trigger` that is dropped counts as cancelled, so a supervisor going away
//! never leaks the tasks it started.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::debug;

const ARMED: u8 = 0;
const TRIPPED: u8 = 1;
const DISARMED: u8 = 2;

struct Shared {
    name: String,
    state: AtomicU8,
    next_id: AtomicU64,
    wakers: Mutex<HashMap<u64, Waker>>,
}

impl Shared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wakers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waker>> {
        // a poisoned map only holds wakers, which are still valid
        self.wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn trip(&self) {
        if self
            .state
            .compare_exchange(ARMED, TRIPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let wakers = self.wakers().drain().collect::<Vec<_>>();
        debug!(
            message = "tripwire tripped",
            name = %self.name,
            waiting = wakers.len()
        );

        for (_id, waker) in wakers {
            waker.wake();
        }
    }
}

pub struct Trigger {
    shared: Arc<Shared>,
}

impl Trigger {
    /// Resolve every associated `Tripwire`.
    pub fn cancel(self) {
        self.shared.trip();
    }

    /// Give up the ability to cancel, associated tripwires stay pending
    /// forever.
    pub fn disarm(self) {
        let _ = self.shared.state.compare_exchange(
            ARMED,
            DISARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.wakers().clear();
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.shared.trip();
    }
}

pub struct Tripwire {
    shared: Arc<Shared>,
    id: u64,
}

impl Tripwire {
    pub fn new(name: impl Into<String>) -> (Trigger, Tripwire) {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: AtomicU8::new(ARMED),
            next_id: AtomicU64::new(0),
            wakers: Mutex::new(HashMap::new()),
        });

        let tripwire = Tripwire {
            id: shared.next_id(),
            shared: Arc::clone(&shared),
        };

        (Trigger { shared }, tripwire)
    }

    /// A tripwire which never resolves, for work that runs until the process
    /// exits.
    pub fn never() -> Tripwire {
        let (trigger, tripwire) = Tripwire::new("never");
        trigger.disarm();
        tripwire
    }

    pub fn is_tripped(&self) -> bool {
        self.shared.state() == TRIPPED
    }
}

impl Clone for Tripwire {
    fn clone(&self) -> Self {
        Tripwire {
            id: self.shared.next_id(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Tripwire {
    fn drop(&mut self) {
        self.shared.wakers().remove(&self.id);
    }
}

impl Future for Tripwire {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.state() {
            TRIPPED => Poll::Ready(()),
            DISARMED => Poll::Pending,
            _ => {
                self.shared.wakers().insert(self.id, cx.waker().clone());

                // the trigger may have fired between the check and the insert
                if self.shared.state() == TRIPPED {
                    self.shared.wakers().remove(&self.id);
                    return Poll::Ready(());
                }

                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    macro_rules! assert_pending {
        ($var:expr) => {
            assert!(futures::poll!(&mut $var).is_pending());
        };
    }

    macro_rules! assert_ready {
        ($var:expr) => {
            assert!(futures::poll!(&mut $var).is_ready());
        };
    }

    #[tokio::test]
    async fn cancel_resolves() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        assert_pending!(tripwire);
        assert!(!tripwire.is_tripped());

        trigger.cancel();
        assert!(tripwire.is_tripped());
        assert_ready!(tripwire);
        assert_ready!(tripwire);
    }

    #[tokio::test]
    async fn dropped_trigger_resolves() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        assert_pending!(tripwire);

        drop(trigger);
        assert_ready!(tripwire);
    }

    #[tokio::test]
    async fn disarmed_never_resolves() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        trigger.disarm();

        assert_pending!(tripwire);
        assert!(!tripwire.is_tripped());

        let mut never = Tripwire::never();
        assert_pending!(never);
    }

    #[tokio::test]
    async fn clones_resolve_together() {
        let (trigger, mut first) = Tripwire::new("test");
        let mut second = first.clone();
        let mut third = second.clone();

        assert_pending!(first);
        assert_pending!(second);
        assert_pending!(third);

        trigger.cancel();

        assert_ready!(first);
        assert_ready!(second);
        assert_ready!(third);
        assert!(first.shared.wakers().is_empty());
    }

    #[tokio::test]
    async fn dropped_tripwire_releases_waker() {
        let (_trigger, mut tripwire) = Tripwire::new("test");
        let mut other = tripwire.clone();
        assert_pending!(tripwire);
        assert_pending!(other);
        assert_eq!(tripwire.shared.wakers().len(), 2);

        drop(other);
        assert_eq!(tripwire.shared.wakers().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn take_until_cancel() {
        let (trigger, tripwire) = Tripwire::new("test");

        let (tx, rx) = tokio::sync::mpsc::channel::<i32>(1);
        let mut stream = ReceiverStream::new(rx).take_until(tripwire);

        tx.send(1).await.expect("send success");
        assert_eq!(stream.next().await, Some(1));

        trigger.cancel();
        assert!(tx.send(2).await.is_ok());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wakes_waiting_task() {
        let (trigger, tripwire) = Tripwire::new("test");

        let handle = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(5), tripwire)
                .await
                .is_ok()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();

        assert!(handle.await.unwrap());
    }
}
