// exposed API of the handoff queue.

use super::{core, pending::ReadCallback};
use tokio::runtime::Handle;

pub use super::{
    core::LifecycleState,
    pending::{DequeueTicket, DrainTicket, Timeout},
};


/// In-process asynchronous handoff queue
///
/// Bridges producer threads delivering values and consumer threads awaiting them, without
/// polling. Producers are never blocked: [`enqueue`](Self::enqueue) either hands its value to
/// the earliest waiting consumer, buffers it, or rejects it outright once the queue is no
/// longer open. Consumers use the two-phase [`begin_dequeue`](Self::begin_dequeue) /
/// [`DequeueTicket::end`] protocol, in which the completion callback may run synchronously
/// inside begin or later on whichever thread resolves the operation.
///
/// Values are delivered in acceptance order, waiting consumers are served in registration
/// order, and each accepted value is delivered to at most one consumer.
///
/// Handles are cheap clones of one shared queue; any number of producer and consumer threads
/// may call into it concurrently. No callback is ever invoked while the queue's internal lock
/// is held, so callbacks may re-enter the queue freely.
pub struct HandoffQueue<T>(core::Queue<T>);

impl<T: Send + 'static> HandoffQueue<T> {
    /// Create an empty, open queue
    ///
    /// Dequeue timeout timers are armed on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime context. Use
    /// [`with_runtime`](Self::with_runtime) to wire a runtime explicitly.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    /// Create an empty, open queue arming its timeout timers on the given runtime
    pub fn with_runtime(runtime: Handle) -> Self {
        HandoffQueue(core::Queue::new(runtime))
    }

    /// Accept a value, delivering it immediately if a consumer is waiting
    ///
    /// If a consumer is waiting, the earliest one's completion callback is invoked
    /// synchronously on this thread with the value. Otherwise the value is buffered at the tail
    /// of the item store.
    ///
    /// Returns `false` once the queue is closing or aborted; the rejected value is dropped, not
    /// buffered. Rejection is a policy outcome, not an error, and callers are expected to check
    /// it.
    pub fn enqueue(&self, value: T) -> bool {
        self.0.enqueue(value, false)
    }

    /// Accept a value, deferring delivery of a matched pair until [`dispatch`](Self::dispatch)
    ///
    /// Acceptance and matching behave exactly like [`enqueue`](Self::enqueue), except that when
    /// a waiting consumer is matched, its outcome is recorded and its callback does not fire
    /// until the next `dispatch` call. Matched pairs are excluded from further matching and
    /// from timeouts; their delivery is already decided.
    pub fn enqueue_deferred(&self, value: T) -> bool {
        self.0.enqueue(value, true)
    }

    /// Fire the callbacks of every deferred matched pair, in FIFO order
    ///
    /// Callbacks run synchronously on this thread. No-op if nothing is pending dispatch.
    pub fn dispatch(&self) {
        self.0.dispatch()
    }

    /// Begin a two-phase dequeue of the next value
    ///
    /// Resolution, evaluated in order at begin time:
    ///
    /// 1. A buffered value exists: completes synchronously with it.
    /// 2. The queue is aborted, or closing with nothing buffered: completes synchronously with
    ///    end-of-stream (`Ok(None)`).
    /// 3. Otherwise the operation waits for a matching enqueue, bounded by `timeout`.
    ///
    /// The callback receives a clone of the returned ticket and may run synchronously inside
    /// this call; once it has run, exactly one ticket clone must be
    /// [`end`](DequeueTicket::end)ed to take the result.
    pub fn begin_dequeue<F>(&self, timeout: Timeout, on_complete: F) -> DequeueTicket<T>
    where
        F: FnOnce(DequeueTicket<T>) + Send + 'static,
    {
        self.0.begin_dequeue(timeout, Box::new(on_complete) as ReadCallback<T>)
    }

    /// Begin a two-phase wait for the item store to become empty
    ///
    /// Completes synchronously if nothing is buffered right now; otherwise completes at the
    /// moment the last buffered value leaves the store, whether popped by a dequeue or
    /// discarded by [`abort`](Self::abort).
    pub fn begin_wait_for_drain<F>(&self, on_complete: F) -> DrainTicket
    where
        F: FnOnce(DrainTicket) + Send + 'static,
    {
        self.0.begin_wait_for_drain(Box::new(on_complete))
    }

    /// Stop accepting new values; already-buffered values remain retrievable in order
    ///
    /// Idempotent. After `close`, every accept returns `false`. Dequeues keep draining the item
    /// store; once it is empty, dequeues complete immediately with end-of-stream. If the store
    /// is already empty at close time, consumers already waiting are resolved with
    /// end-of-stream right away, in registration order.
    pub fn close(&self) {
        self.0.close()
    }

    /// Shut the queue down, discarding buffered values and resolving everything outstanding
    ///
    /// Idempotent, reachable from any state. Buffered values are dropped undelivered; waiting
    /// consumers resolve immediately with end-of-stream; deferred matched pairs fire with their
    /// already-decided values; drain waits are satisfied. Afterwards every accept returns
    /// `false` and every dequeue resolves immediately with end-of-stream.
    pub fn abort(&self) {
        self.0.abort()
    }

    /// Current lifecycle state
    ///
    /// Point-in-time snapshot under concurrency, not a transactional read.
    pub fn lifecycle(&self) -> LifecycleState {
        self.0.lifecycle()
    }

    /// Number of accepted values not yet matched to a consumer
    ///
    /// Point-in-time snapshot under concurrency, not a transactional read.
    pub fn item_count(&self) -> usize {
        self.0.item_count()
    }

    /// Number of dequeue operations waiting for a value
    ///
    /// Point-in-time snapshot under concurrency, not a transactional read.
    pub fn pending_reader_count(&self) -> usize {
        self.0.pending_reader_count()
    }

    /// Number of deferred matched pairs awaiting [`dispatch`](Self::dispatch)
    ///
    /// Point-in-time snapshot under concurrency, not a transactional read.
    pub fn pending_dispatch_count(&self) -> usize {
        self.0.pending_dispatch_count()
    }
}

impl<T: Send + 'static> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        HandoffQueue(self.0.clone())
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Dequeued, TimedOutError};
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering::SeqCst},
            mpsc, Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    fn queue<T: Send + 'static>(rt: &tokio::runtime::Runtime) -> HandoffQueue<T> {
        HandoffQueue::with_runtime(rt.handle().clone())
    }

    // dequeue that is guaranteed to resolve synchronously.
    fn dequeue_now<T: Send + 'static>(queue: &HandoffQueue<T>) -> Dequeued<T> {
        queue.begin_dequeue(Timeout::NonBlocking, |_| {}).end()
    }

    #[test]
    fn fifo_delivery() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        for i in 0..10 {
            assert!(queue.enqueue(i));
        }
        assert_eq!(queue.item_count(), 10);

        for i in 0..10 {
            assert_eq!(dequeue_now(&queue), Ok(Some(i)));
        }
        assert_eq!(queue.item_count(), 0);
    }

    #[test]
    fn waiting_readers_served_in_registration_order() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx_1, rx_1) = mpsc::channel();
        let (tx_2, rx_2) = mpsc::channel();

        queue.begin_dequeue(Timeout::Never, move |t| tx_1.send(t.end()).unwrap());
        queue.begin_dequeue(Timeout::Never, move |t| tx_2.send(t.end()).unwrap());
        assert_eq!(queue.pending_reader_count(), 2);

        assert!(queue.enqueue(11));
        assert!(queue.enqueue(22));
        assert_eq!(rx_1.recv().unwrap(), Ok(Some(11)));
        assert_eq!(rx_2.recv().unwrap(), Ok(Some(22)));
        assert_eq!(queue.pending_reader_count(), 0);
        assert_eq!(queue.item_count(), 0);
    }

    #[test]
    fn scenario_accept_then_abort() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        assert!(queue.enqueue(142));
        let fired = Arc::new(AtomicBool::new(false));
        let fired_2 = Arc::clone(&fired);
        let ticket = queue.begin_dequeue(Timeout::Never, move |_| fired_2.store(true, SeqCst));
        // a buffered value resolves the operation synchronously inside begin
        assert!(fired.load(SeqCst));
        assert_eq!(ticket.end(), Ok(Some(142)));

        queue.abort();
        assert_eq!(queue.item_count(), 0);
        assert_eq!(dequeue_now(&queue), Ok(None));
        assert_eq!(queue.lifecycle(), LifecycleState::Aborted);
    }

    #[test]
    fn scenario_timeout() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx, rx) = mpsc::channel();

        let start = Instant::now();
        queue.begin_dequeue(Timeout::After(Duration::from_millis(250)), move |t| {
            tx.send(t.end()).unwrap();
        });
        assert_eq!(queue.pending_reader_count(), 1);

        let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result, Err(TimedOutError));
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(queue.pending_reader_count(), 0);
    }

    #[test]
    fn scenario_close_drains_in_order() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        for value in [3421, 3422, 3423] {
            assert!(queue.enqueue(value));
        }
        assert_eq!(queue.item_count(), 3);

        let (drain_tx, drain_rx) = mpsc::channel();
        queue.begin_wait_for_drain(move |t| {
            t.end();
            drain_tx.send(()).unwrap();
        });

        queue.close();
        assert_eq!(queue.lifecycle(), LifecycleState::Closing);
        assert!(!queue.enqueue(3424));
        assert!(drain_rx.try_recv().is_err());

        assert_eq!(dequeue_now(&queue), Ok(Some(3421)));
        assert_eq!(dequeue_now(&queue), Ok(Some(3422)));
        assert!(drain_rx.try_recv().is_err());
        assert_eq!(dequeue_now(&queue), Ok(Some(3423)));
        // the drain wait fires the moment the item store hits zero
        drain_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!(dequeue_now(&queue), Ok(None));
        assert_eq!(dequeue_now(&queue), Ok(None));
    }

    #[test]
    fn close_resolves_already_waiting_readers_when_empty() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx, rx) = mpsc::channel();

        queue.begin_dequeue(Timeout::Never, move |t| tx.send(t.end()).unwrap());
        assert!(rx.try_recv().is_err());

        queue.close();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(None));
        assert_eq!(queue.pending_reader_count(), 0);
    }

    #[test]
    fn abort_resolves_waiting_readers_and_drain_waits() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (read_tx, read_rx) = mpsc::channel();
        let (drain_tx, drain_rx) = mpsc::channel();

        assert!(queue.enqueue(1));
        queue.begin_wait_for_drain(move |t| {
            t.end();
            drain_tx.send(()).unwrap();
        });
        assert!(drain_rx.try_recv().is_err());

        assert_eq!(dequeue_now(&queue), Ok(Some(1)));
        drain_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        queue.begin_dequeue(Timeout::Never, move |t| read_tx.send(t.end()).unwrap());
        queue.abort();
        assert_eq!(read_rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(None));
        assert!(!queue.enqueue(2));
    }

    #[test]
    fn abort_discards_buffered_values_and_fires_drain() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (drain_tx, drain_rx) = mpsc::channel();

        assert!(queue.enqueue(5));
        assert!(queue.enqueue(6));
        queue.begin_wait_for_drain(move |t| {
            t.end();
            drain_tx.send(()).unwrap();
        });

        queue.abort();
        assert_eq!(queue.item_count(), 0);
        drain_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(dequeue_now(&queue), Ok(None));
    }

    #[test]
    fn drain_wait_completes_immediately_when_empty() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_2 = Arc::clone(&fired);

        let ticket = queue.begin_wait_for_drain(move |_| fired_2.store(true, SeqCst));
        assert!(fired.load(SeqCst));
        ticket.end();
    }

    #[test]
    fn deferred_dispatch_bookkeeping() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let tx = tx.clone();
            queue.begin_dequeue(Timeout::Never, move |t| tx.send(t.end()).unwrap());
        }
        assert_eq!(queue.pending_reader_count(), 3);

        for value in [1, 2, 3] {
            assert!(queue.enqueue_deferred(value));
        }
        assert_eq!(queue.pending_dispatch_count(), 3);
        assert_eq!(queue.pending_reader_count(), 0);
        assert_eq!(queue.item_count(), 0);
        assert!(rx.try_recv().is_err());

        queue.dispatch();
        assert_eq!(queue.pending_dispatch_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(1)));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(2)));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(3)));
    }

    #[test]
    fn deferred_match_survives_abort_with_its_value() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx, rx) = mpsc::channel();

        queue.begin_dequeue(Timeout::Never, move |t| tx.send(t.end()).unwrap());
        assert!(queue.enqueue_deferred(7));
        assert_eq!(queue.pending_dispatch_count(), 1);

        queue.abort();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(Some(7)));
        assert_eq!(queue.pending_dispatch_count(), 0);
    }

    #[test]
    fn matched_enqueue_cancels_reader_timer() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let (tx, rx) = mpsc::channel();

        queue.begin_dequeue(Timeout::After(Duration::from_secs(30)), move |t| {
            tx.send(t.end()).unwrap();
        });
        assert!(queue.enqueue(9));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(Some(9)));
        assert_eq!(queue.pending_reader_count(), 0);
    }

    #[test]
    fn non_blocking_dequeue() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        // open and empty: a non-blocking dequeue times out rather than waiting
        assert_eq!(dequeue_now(&queue), Err(TimedOutError));

        // closing and empty: end-of-stream, not a timeout
        queue.close();
        assert_eq!(dequeue_now(&queue), Ok(None));
    }

    #[test]
    #[should_panic(expected = "called twice")]
    fn ending_a_ticket_twice_panics() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        let ticket = queue.begin_dequeue(Timeout::NonBlocking, |_| {});
        let duplicate = ticket.clone();
        let _ = ticket.end();
        let _ = duplicate.end();
    }

    #[test]
    #[should_panic(expected = "before the operation completed")]
    fn ending_an_unresolved_ticket_panics() {
        let rt = runtime();
        let queue = queue::<u32>(&rt);

        let ticket = queue.begin_dequeue(Timeout::Never, |_| {});
        let _ = ticket.end();
    }

    #[test]
    fn handoff_1000_test() {
        use rand::prelude::*;
        use rand_pcg::Pcg32;

        let rt = runtime();
        let queue = queue::<u32>(&rt);
        let producer = queue.clone();
        let consumer = queue.clone();

        let join_1 = thread::spawn(move || {
            let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
            for i in 1..=1000 {
                assert!(producer.enqueue(i));
                if rng.gen_ratio(1, 100) {
                    thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
                }
            }
            producer.close();
        });
        let join_2 = thread::spawn(move || {
            let mut expected = 1u32;
            loop {
                let (tx, rx) = mpsc::channel();
                consumer.begin_dequeue(Timeout::After(Duration::from_secs(10)), move |t| {
                    tx.send(t.end()).unwrap();
                });
                match rx.recv_timeout(Duration::from_secs(30)).unwrap() {
                    Ok(Some(value)) => {
                        assert_eq!(value, expected);
                        expected += 1;
                    }
                    Ok(None) => break,
                    Err(TimedOutError) => panic!("dequeue starved"),
                }
            }
            assert_eq!(expected, 1001);
        });
        join_1.join().unwrap();
        join_2.join().unwrap();
    }
}
