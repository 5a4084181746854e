// queue error types.

/// Error for a dequeue whose deadline elapsed before a value arrived
///
/// Deliberately distinct from the end-of-stream completion (`Ok(None)`): a
/// timed-out consumer may retry, a consumer that saw end-of-stream should
/// stop, because no further value will ever be produced.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("dequeue timed out before a value arrived")]
pub struct TimedOutError;

/// Result of a completed dequeue
///
/// - `Ok(Some(value))` — a value was delivered.
/// - `Ok(None)` — end of stream: the queue is closing or aborted and holds
///   nothing more for this consumer. Not an error.
/// - `Err(TimedOutError)` — the operation's deadline elapsed first.
pub type Dequeued<T> = Result<Option<T>, TimedOutError>;
