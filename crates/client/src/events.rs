//! Event delivery for session entities.
//!
//! Requests and WebSocket connections surface their notifications through an
//! [`EventBus`]: a broadcast channel for stream subscribers plus one-shot
//! predicate waiters. Waiters are checked first during [`EventBus::emit`],
//! so `wait_for_*` helpers get guaranteed delivery even when a broadcast
//! receiver is lagging.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};

struct WaiterEntry<E> {
    predicate: Box<dyn Fn(&E) -> bool + Send + Sync>,
    complete_tx: oneshot::Sender<E>,
}

/// Dispatcher combining a broadcast channel with predicate-based waiters.
pub(crate) struct EventBus<E: Clone + Send + 'static> {
    tx: broadcast::Sender<E>,
    waiters: Mutex<Vec<WaiterEntry<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Emits an event to matching waiters, then to all stream subscribers.
    pub fn emit(&self, event: E) {
        {
            let mut waiters = self.waiters.lock();
            let mut i = 0;
            while i < waiters.len() {
                if (waiters[i].predicate)(&event) {
                    let entry = waiters.swap_remove(i);
                    let _ = entry.complete_tx.send(event.clone());
                } else {
                    i += 1;
                }
            }
        }
        let _ = self.tx.send(event);
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Registers a waiter completed by the first event matching `predicate`.
    pub fn register_waiter<F>(&self, predicate: F) -> oneshot::Receiver<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (complete_tx, complete_rx) = oneshot::channel();
        self.waiters.lock().push(WaiterEntry {
            predicate: Box::new(predicate),
            complete_tx,
        });
        complete_rx
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Wrapper around [`broadcast::Receiver`] with automatic lag handling.
///
/// Broadcast lag is logged and skipped rather than surfaced, so event
/// processing loops never break on [`RecvError::Lagged`].
///
/// [`broadcast::Receiver`]: tokio::sync::broadcast::Receiver
/// [`RecvError::Lagged`]: tokio::sync::broadcast::error::RecvError::Lagged
pub struct EventStream<E: Clone + Send + 'static> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> EventStream<E> {
    pub(crate) fn new(rx: broadcast::Receiver<E>) -> Self {
        Self { rx }
    }

    /// Receives the next event, or `None` when the source entity is dropped.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Attempts to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

/// One-shot event waiter with timeout. Internal to the `wait_for_*`
/// helpers; entities never hand one out.
pub(crate) struct EventWaiter<E> {
    rx: oneshot::Receiver<E>,
    timeout: Duration,
}

impl<E: Send + 'static> EventWaiter<E> {
    pub(crate) fn new(rx: oneshot::Receiver<E>, timeout: Duration) -> Self {
        Self { rx, timeout }
    }

    /// Waits for the event.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no matching event arrives in time
    /// - [`Error::ChannelClosed`] if the event source is dropped
    pub async fn wait(self) -> Result<E> {
        tokio::time::timeout(self.timeout, self.rx)
            .await
            .map_err(|_| Error::Timeout("Timeout waiting for event".to_string()))?
            .map_err(|_| Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEvent {
        id: u32,
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(TestEvent { id: 1 });

        assert_eq!(rx1.recv().await.unwrap().id, 1);
        assert_eq!(rx2.recv().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn waiter_completes_on_matching_event_only() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut rx = bus.register_waiter(|e| e.id == 2);

        bus.emit(TestEvent { id: 1 });
        assert!(rx.try_recv().is_err());

        bus.emit(TestEvent { id: 2 });
        assert_eq!(rx.await.unwrap().id, 2);
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn event_waiter_times_out() {
        let (_tx, rx) = oneshot::channel::<TestEvent>();
        let waiter = EventWaiter::new(rx, Duration::from_millis(10));
        assert!(matches!(waiter.wait().await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut stream = EventStream::new(bus.subscribe());
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
