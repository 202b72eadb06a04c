//! Single-consumer FIFO queue with an installable handler
//!
//! Items are delivered in arrival order to at most one consumer at a time:
//! either a repeating handler installed with [`HandlerQueue::set_handler`],
//! or a one-shot waiter created by [`HandlerQueue::next`]. Items that
//! arrive while no consumer is installed are held until one is.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{oneshot, Notify};

type Handler<T> = Box<dyn FnMut(T) + Send>;

enum Consumer<T> {
    Repeating(Handler<T>),
    Once(oneshot::Sender<T>),
}

struct State<T> {
    pending: VecDeque<T>,
    consumer: Option<Consumer<T>>,
    closed: bool,
}

/// FIFO queue with at most one active consumer
///
/// Handlers run while the queue's lock is held; they must not call back
/// into the same queue.
pub struct HandlerQueue<T> {
    state: Mutex<State<T>>,
    space: Notify,
    capacity: usize,
}

impl<T: Send + 'static> Default for HandlerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> HandlerQueue<T> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::bounded(usize::MAX)
    }

    /// Create a queue whose [`push`](Self::push) waits while `capacity`
    /// items are pending
    pub fn bounded(capacity: usize) -> Self {
        HandlerQueue {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                consumer: None,
                closed: false,
            }),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // A panicking handler must not wedge every later caller
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(state: &mut State<T>, item: T) {
        match state.consumer.take() {
            Some(Consumer::Repeating(mut handler)) => {
                handler(item);
                state.consumer = Some(Consumer::Repeating(handler));
            }
            Some(Consumer::Once(tx)) => {
                // Waiter went away; keep the item for the next consumer
                if let Err(item) = tx.send(item) {
                    state.pending.push_back(item);
                }
            }
            None => state.pending.push_back(item),
        }
    }

    /// Enqueue or deliver an item without waiting for space
    ///
    /// Returns false (dropping the item) once the queue is closed.
    pub fn handle(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        Self::deliver(&mut state, item);
        true
    }

    /// Enqueue only if there is room; returns false when full or closed
    pub fn offer(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed || (state.consumer.is_none() && state.pending.len() >= self.capacity) {
            return false;
        }
        Self::deliver(&mut state, item);
        true
    }

    /// Enqueue an item, waiting while the queue is full
    ///
    /// Returns false if the queue is closed before the item is accepted.
    pub async fn push(&self, item: T) -> bool {
        let mut item = Some(item);
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return false;
                }
                if state.consumer.is_some() || state.pending.len() < self.capacity {
                    if let Some(item) = item.take() {
                        Self::deliver(&mut state, item);
                    }
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Install a repeating handler, replacing any previous consumer
    ///
    /// Pending items are handed to the new handler in arrival order first.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut handler: Handler<T> = Box::new(handler);
        {
            let mut state = self.lock();
            while let Some(item) = state.pending.pop_front() {
                handler(item);
            }
            state.consumer = Some(Consumer::Repeating(handler));
        }
        self.space.notify_waiters();
    }

    /// Remove the installed consumer; later items are held again
    pub fn clear_handler(&self) {
        self.lock().consumer = None;
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is closed and drained, while a
    /// repeating handler is installed, or if another consumer replaces
    /// this waiter. An installed handler is never displaced.
    pub async fn next(&self) -> Option<T> {
        let rx = {
            let mut state = self.lock();
            if let Some(item) = state.pending.pop_front() {
                drop(state);
                self.space.notify_waiters();
                return Some(item);
            }
            if state.closed || matches!(state.consumer, Some(Consumer::Repeating(_))) {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.consumer = Some(Consumer::Once(tx));
            rx
        };
        rx.await.ok()
    }

    /// Close the queue: pending items stay drainable, new items are refused
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.consumer = None;
        }
        self.space.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of undelivered items
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// True when no items are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for HandlerQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
