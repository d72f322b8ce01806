//! Bridge from background callbacks to an async stream.
//!
//! Background tasks push [`StreamEvent`]s into a bounded channel and the
//! application consumes them as a [`futures::Stream`] of `Result<T>`. A full
//! channel makes the sender wait, so a slow consumer stalls the producer side
//! instead of growing a local buffer.
//!
//! Terminal signals ([`EventSender::finish`], [`EventSender::fail`],
//! [`EventSender::cancel`]) bypass the channel and never wait for room.

use std::pin::Pin;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// One item pushed through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Data(T),
    Error(Error),
    /// Terminates the stream.
    Complete,
}

/// Single-subscriber guard.
///
/// At most one [`EventStream`] holds the subscription at a time; it is
/// released when that stream is dropped.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the subscription. Returns false if it is already held.
    pub fn try_acquire(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// How a stream ends when signalled out of band.
#[derive(Debug)]
enum Ending {
    /// Yield what is buffered, then end.
    Finish,
    /// Yield what is buffered, then the error, then end.
    Fail(Error),
    /// End now, dropping anything buffered.
    Cancel,
}

#[derive(Debug, Default)]
struct Control {
    ending: Mutex<Option<Ending>>,
    waker: AtomicWaker,
}

impl Control {
    fn signal(&self, ending: Ending) {
        {
            let mut current = self.ending.lock().unwrap_or_else(|p| p.into_inner());
            // First ending wins, except that a cancel overrides.
            if current.is_some() && !matches!(ending, Ending::Cancel) {
                return;
            }
            *current = Some(ending);
        }
        self.waker.wake();
    }

    fn is_cancelled(&self) -> bool {
        matches!(
            *self.ending.lock().unwrap_or_else(|p| p.into_inner()),
            Some(Ending::Cancel)
        )
    }

    fn take(&self) -> Option<Ending> {
        self.ending.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Create a bridge with room for `capacity` undelivered events.
pub fn channel<T>(capacity: usize) -> (EventSender<T>, EventStream<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let control = Arc::new(Control::default());
    (
        EventSender {
            tx,
            control: control.clone(),
        },
        EventStream {
            rx,
            control,
            on_data: None,
            guard: None,
            done: false,
        },
    )
}

/// Producer half of the bridge.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<StreamEvent<T>>,
    control: Arc<Control>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            control: self.control.clone(),
        }
    }
}

impl<T> EventSender<T> {
    /// Send a data item, waiting for room. Returns false once the stream is gone.
    pub async fn data(&self, item: T) -> bool {
        self.tx.send(StreamEvent::Data(item)).await.is_ok()
    }

    /// Send an error item, waiting for room. Returns false once the stream is gone.
    pub async fn error(&self, error: Error) -> bool {
        self.tx.send(StreamEvent::Error(error)).await.is_ok()
    }

    /// Signal end of stream.
    pub async fn complete(&self) {
        let _ = self.tx.send(StreamEvent::Complete).await;
    }

    /// Queue `item` without waiting. Hands it back when the channel is full
    /// or the stream is gone.
    pub fn try_send(&self, item: Result<T>) -> std::result::Result<(), Result<T>> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(match item {
                    Ok(data) => StreamEvent::Data(data),
                    Err(e) => StreamEvent::Error(e),
                });
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// End the stream after the events already queued.
    pub fn finish(&self) {
        self.control.signal(Ending::Finish);
    }

    /// End the stream with `error` after the events already queued.
    pub fn fail(&self, error: Error) {
        self.control.signal(Ending::Fail(error));
    }

    /// End the stream now. Queued events are never yielded.
    pub fn cancel(&self) {
        self.control.signal(Ending::Cancel);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the receiving stream has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer half of the bridge.
///
/// Yields `Ok(item)` for data, `Err(error)` for errors, and ends on
/// [`StreamEvent::Complete`], on an out-of-band ending, or when every sender
/// is dropped.
pub struct EventStream<T> {
    rx: mpsc::Receiver<StreamEvent<T>>,
    control: Arc<Control>,
    on_data: Option<Box<dyn Fn(&T) + Send + Sync>>,
    guard: Option<Subscription>,
    done: bool,
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("done", &self.done)
            .field("subscribed", &self.guard.is_some())
            .finish()
    }
}

impl<T> EventStream<T> {
    /// Tie `subscription` to this stream; it is released on drop.
    pub(crate) fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.guard = Some(subscription);
        self
    }

    /// Run `hook` on each data item as it is handed to the caller.
    pub(crate) fn with_data_hook(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Box::new(hook));
        self
    }

    /// Receive the next item.
    pub async fn next_event(&mut self) -> Option<Result<T>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    fn end(&mut self) -> Option<Result<T>> {
        self.done = true;
        self.rx.close();
        None
    }

    fn map_event(&mut self, event: Option<StreamEvent<T>>) -> Option<Result<T>> {
        match event {
            Some(StreamEvent::Data(item)) => {
                if let Some(hook) = &self.on_data {
                    hook(&item);
                }
                Some(Ok(item))
            }
            Some(StreamEvent::Error(e)) => Some(Err(e)),
            Some(StreamEvent::Complete) => self.end(),
            // Every sender is gone; a failure signalled on the way out still
            // reaches the caller.
            None => match self.control.take() {
                Some(ending) => self.apply(ending),
                None => self.end(),
            },
        }
    }

    fn apply(&mut self, ending: Ending) -> Option<Result<T>> {
        match ending {
            Ending::Fail(e) => {
                self.end();
                Some(Err(e))
            }
            Ending::Finish | Ending::Cancel => self.end(),
        }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.control.waker.register(cx.waker());
        if this.control.is_cancelled() {
            return Poll::Ready(this.end());
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.map_event(event)),
            Poll::Pending => match this.control.take() {
                Some(ending) => Poll::Ready(this.apply(ending)),
                None => Poll::Pending,
            },
        }
    }
}

impl<T> Unpin for EventStream<T> {}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_events_map_to_results() {
        let (tx, mut stream) = channel::<u32>(4);
        tokio::spawn(async move {
            tx.data(1).await;
            tx.error(Error::Commit("nope".into())).await;
            tx.data(2).await;
            tx.complete().await;
            tx.data(3).await;
        });

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Err(Error::Commit("nope".into()))));
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_sender_drop_ends_stream() {
        let (tx, mut stream) = channel::<u32>(1);
        drop(tx);
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_bounded_channel_blocks_sender() {
        let (tx, mut stream) = channel::<u32>(1);
        assert!(tx.data(1).await);
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), tx.data(2)).await;
        assert!(blocked.is_err());
        assert_eq!(stream.next().await, Some(Ok(1)));
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_sender() {
        let (tx, stream) = channel::<u32>(1);
        drop(stream);
        assert!(tx.is_closed());
        assert!(!tx.data(1).await);
    }

    #[tokio::test]
    async fn test_fail_does_not_wait_for_room() {
        let (tx, mut stream) = channel::<u32>(1);
        assert!(tx.data(1).await);
        tx.fail(Error::Connection("gone".into()));

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Err(Error::Connection("gone".into()))));
        assert_eq!(stream.next().await, None);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_fail_survives_sender_drop() {
        let (tx, mut stream) = channel::<u32>(2);
        assert!(tx.data(1).await);
        tx.fail(Error::Connection("closed".into()));
        drop(tx);

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, Some(Err(Error::Connection("closed".into()))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_finish_wakes_pending_stream() {
        let (tx, mut stream) = channel::<u32>(1);
        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.finish();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_drops_buffered_items() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = seen.clone();
        let (tx, stream) = channel::<u32>(4);
        let mut stream = stream.with_data_hook(move |n| hook.lock().unwrap().push(*n));
        assert!(tx.data(1).await);
        assert!(tx.data(2).await);
        assert_eq!(stream.next().await, Some(Ok(1)));

        tx.cancel();
        tx.fail(Error::Connection("late".into()));
        assert_eq!(stream.next().await, None);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_try_send_hands_back_when_full() {
        let (tx, _stream) = channel::<u32>(1);
        assert!(tx.try_send(Ok(1)).is_ok());
        assert_eq!(tx.try_send(Ok(2)), Err(Ok(2)));
    }

    #[test]
    fn test_subscription_single_holder() {
        let subscription = Subscription::new();
        assert!(subscription.try_acquire());
        assert!(!subscription.try_acquire());

        let (_tx, stream) = channel::<u32>(1);
        let stream = stream.with_subscription(subscription.clone());
        assert!(subscription.is_active());
        drop(stream);
        assert!(!subscription.is_active());
        assert!(subscription.try_acquire());
    }
}
