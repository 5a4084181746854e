// queue core: owns the shared state and every bookkeeping transition.
//
// lock discipline: the central mutex is held only while mutating bookkeeping, never while a
// completion callback runs. every operation collects the callbacks it decided to fire into a
// batch while locked, releases the lock, then fires the batch in FIFO order. a callback may
// therefore re-enter the queue freely.

use super::{
    error::{Dequeued, TimedOutError},
    pending::{
        DequeueTicket, DrainCallback, DrainTicket, DrainWait, PendingRead, ReadCallback,
        TimerTask, Timeout,
    },
};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    mem::take,
    sync::{
        atomic::{Ordering::Relaxed, AtomicU8},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::runtime::Handle;


/// Lifecycle gate controlling whether the queue accepts new values
///
/// Transitions are monotonic: `Open` -> `Closing` -> `Aborted`, or `Open` -> `Aborted` directly.
/// `Aborted` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    /// Accepting values and registering waiting consumers.
    Open,
    /// No longer accepting. Buffered values remain retrievable, after which consumers see
    /// end-of-stream.
    Closing,
    /// Buffered values discarded. Every dequeue resolves immediately with end-of-stream.
    Aborted,
}

// convert the atomic lifecycle byte back into the typed state.
fn lifecycle_from_byte(byte: u8) -> LifecycleState {
    if byte == LifecycleState::Open as u8 {
        LifecycleState::Open
    } else if byte == LifecycleState::Closing as u8 {
        LifecycleState::Closing
    } else if byte == LifecycleState::Aborted as u8 {
        LifecycleState::Aborted
    } else {
        unreachable!("invalid lifecycle byte: {}", byte)
    }
}

// handle to a queue.
pub(crate) struct Queue<T>(Arc<Shared<T>>);

// queue shared state.
struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,

    // lifecycle byte. written only under the mutex; read lock-free on fast paths, with an
    // authoritative re-check under the lock before anything is mutated.
    //
    // - begins as Open. transitions are monotonic: Open -> Closing -> Aborted, or Open -> Aborted.
    // - anything other than Open means accept calls return false.
    lifecycle: AtomicU8,

    // runtime used to arm dequeue timeout timers.
    runtime: Handle,
}

// queue lockable state.
struct Lockable<T> {
    // item store: accepted values not yet matched to a consumer. FIFO.
    items: VecDeque<T>,
    // reader registry: pending reads that have no value yet. FIFO.
    readers: VecDeque<Arc<PendingRead<T>>>,
    // matched-dispatch list: decided pairs awaiting an explicit dispatch call. FIFO.
    matched: VecDeque<(Arc<PendingRead<T>>, T)>,
    // drain waits: completed when the item store becomes empty.
    drain_waits: SmallVec<[Arc<DrainWait>; 2]>,
}

// callbacks decided under the lock, fired in order after release.
type Completions<T> = SmallVec<[Completion<T>; 4]>;

enum Completion<T> {
    Read(ReadCallback<T>, DequeueTicket<T>),
    Drain(DrainCallback, DrainTicket),
}

fn fire<T>(completions: Completions<T>) {
    for completion in completions {
        match completion {
            Completion::Read(callback, ticket) => callback(ticket),
            Completion::Drain(callback, ticket) => callback(ticket),
        }
    }
}

// complete a freshly created read on the calling thread, before anyone else can know about it.
fn complete_now<T>(read: &Arc<PendingRead<T>>, result: Dequeued<T>) {
    let callback = read
        .try_complete(result)
        .expect("internal bug: fresh read already completed");
    callback(DequeueTicket(Arc::clone(read)));
}

// resolve every waiting reader with end-of-stream, FIFO.
fn flush_readers<T>(lock: &mut Lockable<T>, completions: &mut Completions<T>) {
    while let Some(read) = lock.readers.pop_front() {
        if let Some(callback) = read.try_complete(Ok(None)) {
            completions.push(Completion::Read(callback, DequeueTicket(read)));
        }
    }
}

// the item store just became empty: collect every drain wait for firing.
fn drained<T>(lock: &mut Lockable<T>, completions: &mut Completions<T>) {
    for wait in lock.drain_waits.drain(..) {
        if let Some(callback) = wait.try_complete() {
            completions.push(Completion::Drain(callback, DrainTicket(wait)));
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    // construct an empty, open queue arming its timers on the given runtime.
    pub(crate) fn new(runtime: Handle) -> Self {
        Queue(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                items: VecDeque::new(),
                readers: VecDeque::new(),
                matched: VecDeque::new(),
                drain_waits: SmallVec::new(),
            }),
            lifecycle: AtomicU8::new(LifecycleState::Open as u8),
            runtime,
        }))
    }

    // clone another handle to the queue.
    pub(crate) fn clone(&self) -> Self {
        Queue(Arc::clone(&self.0))
    }

    // atomic-read the lifecycle state. point-in-time snapshot.
    pub(crate) fn lifecycle(&self) -> LifecycleState {
        lifecycle_from_byte(self.0.lifecycle.load(Relaxed))
    }

    // lock the queue.
    fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.0.lockable.lock().unwrap()
    }

    // accept a value, matching the earliest waiting reader if one exists. with defer set, a
    // matched pair is parked in the matched-dispatch list instead of firing its callback now.
    //
    // returns false, without retaining the value, unless the queue is open.
    pub(crate) fn enqueue(&self, value: T, defer: bool) -> bool {
        // fast path rejection without locking
        if self.lifecycle() != LifecycleState::Open {
            return false;
        }
        let mut lock = self.lock();
        // now that the queue is locked, re-check without race conditions
        if self.lifecycle() != LifecycleState::Open {
            return false;
        }

        // match the earliest reader that has not already resolved. a reader that lost to its
        // timer may still sit in the registry until the timer thread removes it; skip those.
        while let Some(read) = lock.readers.pop_front() {
            if !read.claim() {
                continue;
            }
            if defer {
                lock.matched.push_back((read, value));
                return true;
            }
            drop(lock);
            let callback = read
                .finish_claimed(Ok(Some(value)))
                .expect("internal bug: claimed read lost its callback");
            callback(DequeueTicket(read));
            return true;
        }

        // no waiting reader: buffer the value
        lock.items.push_back(value);
        true
    }

    // fire every parked matched pair, FIFO, then clear the list. no-op when the list is empty.
    pub(crate) fn dispatch(&self) {
        let matched = take(&mut self.lock().matched);
        for (read, value) in matched {
            let callback = read
                .finish_claimed(Ok(Some(value)))
                .expect("internal bug: claimed read lost its callback");
            callback(DequeueTicket(read));
        }
    }

    // two-phase dequeue. resolution order at begin time:
    //
    // 1. a buffered value exists: pop it and complete synchronously with it.
    // 2. aborted, or closing with an empty store: complete synchronously with end-of-stream.
    // 3. otherwise register the read, arming a timer if the timeout is finite. NonBlocking
    //    completes synchronously with a timeout instead of registering.
    pub(crate) fn begin_dequeue(
        &self,
        timeout: Timeout,
        callback: ReadCallback<T>,
    ) -> DequeueTicket<T> {
        let read = Arc::new(PendingRead::new(callback));
        let ticket = DequeueTicket(Arc::clone(&read));

        let mut lock = self.lock();
        if let Some(value) = lock.items.pop_front() {
            let mut completions = Completions::new();
            if lock.items.is_empty() {
                drained(&mut lock, &mut completions);
            }
            drop(lock);
            complete_now(&read, Ok(Some(value)));
            fire(completions);
            return ticket;
        }

        match self.lifecycle() {
            LifecycleState::Aborted | LifecycleState::Closing => {
                drop(lock);
                complete_now(&read, Ok(None));
            }
            LifecycleState::Open => match timeout {
                Timeout::NonBlocking => {
                    drop(lock);
                    complete_now(&read, Err(TimedOutError));
                }
                Timeout::Never => {
                    lock.readers.push_back(read);
                }
                Timeout::After(duration) => {
                    lock.readers.push_back(Arc::clone(&read));
                    drop(lock);
                    self.arm_timer(read, duration);
                }
            },
        }
        ticket
    }

    // arm the one-shot timeout for a registered read.
    fn arm_timer(&self, read: Arc<PendingRead<T>>, duration: Duration) {
        let queue = self.clone();
        let timer_read = Arc::clone(&read);
        let timer = TimerTask::spawn_on(&self.0.runtime, async move {
            tokio::time::sleep(duration).await;
            queue.expire(&timer_read);
        });
        read.arm_timer(timer);
    }

    // timer path: resolve a read with a timeout unless some other path got there first, and
    // remove it from the reader registry.
    fn expire(&self, read: &Arc<PendingRead<T>>) {
        let Some(callback) = read.try_complete(Err(TimedOutError)) else {
            return;
        };
        {
            let mut lock = self.lock();
            lock.readers.retain(|r| !Arc::ptr_eq(r, read));
        }
        trace!("dequeue timed out");
        callback(DequeueTicket(Arc::clone(read)));
    }

    // open -> closing. idempotent. values already buffered stay retrievable in order; if the
    // store is already empty, proactively resolve every waiting reader with end-of-stream.
    pub(crate) fn close(&self) {
        let mut lock = self.lock();
        if self.lifecycle() != LifecycleState::Open {
            return;
        }
        self.0.lifecycle.store(LifecycleState::Closing as u8, Relaxed);
        let mut completions = Completions::new();
        if lock.items.is_empty() {
            flush_readers(&mut lock, &mut completions);
        }
        drop(lock);
        debug!("queue closed");
        fire(completions);
    }

    // transition to aborted from any state. idempotent. discards the item store undelivered,
    // resolves every waiting reader with end-of-stream, fires every decided-but-undispatched
    // pair with its value, and satisfies every drain wait.
    pub(crate) fn abort(&self) {
        let mut lock = self.lock();
        if self.lifecycle() == LifecycleState::Aborted {
            return;
        }
        self.0.lifecycle.store(LifecycleState::Aborted as u8, Relaxed);
        let discarded = take(&mut lock.items);
        let matched = take(&mut lock.matched);
        let mut completions = Completions::new();
        flush_readers(&mut lock, &mut completions);
        drained(&mut lock, &mut completions);
        drop(lock);
        debug!(discarded = discarded.len(), "queue aborted");
        drop(discarded);
        for (read, value) in matched {
            let callback = read
                .finish_claimed(Ok(Some(value)))
                .expect("internal bug: claimed read lost its callback");
            callback(DequeueTicket(read));
        }
        fire(completions);
    }

    // two-phase wait for the item store to become empty. completes synchronously if it already
    // is; otherwise registered and completed by whichever thread removes the last value.
    pub(crate) fn begin_wait_for_drain(&self, callback: DrainCallback) -> DrainTicket {
        let wait = Arc::new(DrainWait::new(callback));
        let ticket = DrainTicket(Arc::clone(&wait));
        let mut lock = self.lock();
        if lock.items.is_empty() {
            drop(lock);
            let callback = wait
                .try_complete()
                .expect("internal bug: fresh drain wait already completed");
            callback(DrainTicket(wait));
        } else {
            lock.drain_waits.push(wait);
        }
        ticket
    }

    // diagnostic counters. point-in-time snapshots, racy by nature.

    pub(crate) fn item_count(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn pending_reader_count(&self) -> usize {
        self.lock().readers.len()
    }

    pub(crate) fn pending_dispatch_count(&self) -> usize {
        self.lock().matched.len()
    }
}
