use futures_util::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Multicast event source which can be completed.
///
/// Every [Subscription] receives all values published after it was created. Once the subject
/// is completed all subscriptions end and any further values are discarded.
#[derive(Debug)]
pub struct Subject<T> {
    /// `None` once the subject has been completed.
    subscribers: Mutex<Option<Vec<UnboundedSender<T>>>>,
}

impl<T: Clone> Subject<T> {
    pub fn new() -> Self {
        Subject {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Starts a new subscription. Subscribing to a completed subject returns a stream which
    /// ends immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = unbounded_channel();
        let mut guard = self.lock();
        if let Some(subscribers) = guard.as_mut() {
            subscribers.push(tx);
        }
        Subscription { receiver: rx }
    }

    /// Publishes a value to all live subscribers. Subscribers which dropped their
    /// [Subscription] are forgotten.
    pub fn next(&self, value: T) {
        let mut guard = self.lock();
        if let Some(subscribers) = guard.as_mut() {
            subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    /// Ends all subscriptions. Returns `true` only for the call which actually completed
    /// the subject.
    pub fn complete(&self) -> bool {
        self.lock().take().is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<UnboundedSender<T>>>> {
        // subscriber list is always left consistent, so a poisoned lock is still usable
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for Subject<T> {
    fn default() -> Self {
        Subject::new()
    }
}

/// Stream of values published by a [Subject].
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Receives the next value, or `None` once the subject completed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
