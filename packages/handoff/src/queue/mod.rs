// implementation of the handoff queue.
//
// the basic architecture is as such:
//
// queue handles wrap around Arc<Mutex<shared state>>
//                                        |
//          /-----------------------------/
//          v
//       shared state
//          |
//          |------ it contains the item store: a VecDeque<T> of values that have been accepted
//          |       but not yet matched to a consumer
//          |
//          |------ it contains the reader registry: a VecDeque of pending-read records, one per
//          |       outstanding begin_dequeue that found no value. each record has a slot for a
//          |       completion callback, a result slot, and a once-only completed flag. the queue
//          |       structure is what gives FIFO service order to waiting consumers.
//          |
//          |------ it contains the matched-dispatch list: (pending read, value) pairs whose
//          |       outcome is decided but whose callback waits for an explicit dispatch() call
//          |
//          \------ it contains the drain-wait registry, for callers awaiting an empty item store
//
// there is also an atomic lifecycle byte (open / closing / aborted) read lock-free on fast paths
// and re-checked under the lock before anything is mutated.
//
// the organization of these modules is as such:
//
//      pending<------------core: owns the shared state and every bookkeeping transition. it
//                          ^     collects completion callbacks while the lock is held and fires
//                          |     them only after releasing it.
//                          |
//                          api: a thin, documented wrapper around core that the crate re-exports
//                               publically, plus the ticket types consumers hold.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;

pub(crate) mod pending;
mod core;
