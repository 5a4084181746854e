// pending-operation records: one per outstanding dequeue or drain wait, plus the tickets that
// consumers hold for the two-phase begin/end protocol.

use super::error::Dequeued;
use std::{
    future::Future,
    sync::{
        atomic::{Ordering::Relaxed, AtomicBool},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{runtime::Handle, task::AbortHandle};


/// Deadline policy for a dequeue operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Timeout {
    /// Wait indefinitely for a value.
    Never,
    /// Wait at most this long, then resolve with
    /// [`TimedOutError`](crate::error::TimedOutError).
    After(Duration),
    /// Never wait: if no value is immediately available on an open queue, resolve synchronously
    /// with [`TimedOutError`](crate::error::TimedOutError).
    NonBlocking,
}


// completion callback for a dequeue. receives a ticket clone so it can end() the operation.
pub(crate) type ReadCallback<T> = Box<dyn FnOnce(DequeueTicket<T>) + Send>;

// completion callback for a drain wait.
pub(crate) type DrainCallback = Box<dyn FnOnce(DrainTicket) + Send>;


// one outstanding dequeue operation.
//
// lives in the reader registry until matched, timed out, or force-resolved by close/abort. also
// referenced by up to two tickets and possibly a timer task. the completed flag is the
// exactly-once gate: whichever path swaps it first owns completion, every later path backs off.
// this closes the race between a timer firing and a concurrent match/close/abort.
pub(crate) struct PendingRead<T> {
    completed: AtomicBool,
    inner: Mutex<ReadInner<T>>,
}

struct ReadInner<T> {
    // present until completion takes it for firing.
    callback: Option<ReadCallback<T>>,
    // present from completion until end() takes it.
    result: Option<Dequeued<T>>,
    // armed one-shot timeout, if any. dropping the handle cancels the sleep task.
    timer: Option<TimerTask>,
}

impl<T> PendingRead<T> {
    pub(crate) fn new(callback: ReadCallback<T>) -> Self {
        PendingRead {
            completed: AtomicBool::new(false),
            inner: Mutex::new(ReadInner {
                callback: Some(callback),
                result: None,
                timer: None,
            }),
        }
    }

    // claim the right to complete this read. returns false if some other path already claimed it.
    // claiming disarms the timer, cancelling its sleep task.
    //
    // a claimed read holds its callback until finish_claimed. the deferred-dispatch path claims
    // at match time and finishes at dispatch time; every other path does both at once via
    // try_complete.
    pub(crate) fn claim(&self) -> bool {
        if self.completed.swap(true, Relaxed) {
            return false;
        }
        self.inner.lock().unwrap().timer = None;
        true
    }

    // store the result of an already-claimed read and take its callback for firing.
    //
    // the caller must invoke the callback only after releasing the queue lock.
    pub(crate) fn finish_claimed(&self, result: Dequeued<T>) -> Option<ReadCallback<T>> {
        let mut inner = self.inner.lock().unwrap();
        inner.result = Some(result);
        inner.callback.take()
    }

    // claim and finish in one step. returns the callback if this path won the race.
    pub(crate) fn try_complete(&self, result: Dequeued<T>) -> Option<ReadCallback<T>> {
        if !self.claim() {
            return None;
        }
        self.finish_claimed(result)
    }

    // attach the one-shot timeout, unless the read already completed (in which case the handle is
    // dropped and the freshly spawned task aborted).
    pub(crate) fn arm_timer(&self, timer: TimerTask) {
        let mut inner = self.inner.lock().unwrap();
        if !self.completed.load(Relaxed) {
            inner.timer = Some(timer);
        }
    }
}


/// Token for one two-phase dequeue operation
///
/// [`begin_dequeue`](crate::HandoffQueue::begin_dequeue) returns one clone and passes another to
/// the completion callback, which may run synchronously inside `begin_dequeue` or later on
/// whichever thread resolves the operation. After the callback has run, exactly one clone may be
/// [`end`](Self::end)ed to take the result.
///
/// A ticket is bound to its operation by construction, so "ending an unrelated token" is
/// unrepresentable.
pub struct DequeueTicket<T>(pub(crate) Arc<PendingRead<T>>);

impl<T> Clone for DequeueTicket<T> {
    fn clone(&self) -> Self {
        DequeueTicket(Arc::clone(&self.0))
    }
}

impl<T> DequeueTicket<T> {
    /// Take the result of the completed dequeue, exactly once
    ///
    /// # Panics
    ///
    /// Ending a ticket twice (through both clones), or before the operation's completion
    /// callback has fired, is a caller bug and fails fast with a panic rather than being
    /// reported through [`Dequeued`].
    pub fn end(self) -> Dequeued<T> {
        let mut inner = self.0.inner.lock().unwrap();
        assert!(
            self.0.completed.load(Relaxed) && inner.callback.is_none(),
            "DequeueTicket::end called before the operation completed",
        );
        inner
            .result
            .take()
            .expect("DequeueTicket::end called twice for the same operation")
    }
}


// one outstanding wait for the item store to become empty. same exactly-once discipline as
// PendingRead, but the only outcome is success, so there is no result slot.
pub(crate) struct DrainWait {
    completed: AtomicBool,
    inner: Mutex<DrainInner>,
}

struct DrainInner {
    callback: Option<DrainCallback>,
    ended: bool,
}

impl DrainWait {
    pub(crate) fn new(callback: DrainCallback) -> Self {
        DrainWait {
            completed: AtomicBool::new(false),
            inner: Mutex::new(DrainInner { callback: Some(callback), ended: false }),
        }
    }

    // claim completion and take the callback for firing, or return none if already completed.
    pub(crate) fn try_complete(&self) -> Option<DrainCallback> {
        if self.completed.swap(true, Relaxed) {
            return None;
        }
        self.inner.lock().unwrap().callback.take()
    }
}


/// Token for one two-phase wait-for-drain operation
///
/// Mirrors [`DequeueTicket`]: one clone is returned by
/// [`begin_wait_for_drain`](crate::HandoffQueue::begin_wait_for_drain), another goes to the
/// completion callback, and exactly one of them acknowledges completion via [`end`](Self::end).
pub struct DrainTicket(pub(crate) Arc<DrainWait>);

impl Clone for DrainTicket {
    fn clone(&self) -> Self {
        DrainTicket(Arc::clone(&self.0))
    }
}

impl DrainTicket {
    /// Acknowledge the completed drain wait, exactly once
    ///
    /// # Panics
    ///
    /// Panics if the operation has not completed or was already ended through another clone.
    pub fn end(self) {
        let mut inner = self.0.inner.lock().unwrap();
        assert!(
            self.0.completed.load(Relaxed) && inner.callback.is_none(),
            "DrainTicket::end called before the operation completed",
        );
        assert!(!inner.ended, "DrainTicket::end called twice for the same operation");
        inner.ended = true;
    }
}


// spawned one-shot task that aborts when dropped.
//
// used for dequeue timeouts: a read resolved by any earlier path cancels its timer simply by
// dropping the handle.
pub(crate) struct TimerTask(AbortHandle);

impl TimerTask {
    // spawn a future on the given runtime and wrap its abort handle.
    pub(crate) fn spawn_on<F>(runtime: &Handle, f: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        TimerTask(runtime.spawn(f).abort_handle())
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
