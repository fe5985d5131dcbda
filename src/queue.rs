//! Admission Queue Boundary
//!
//! Client connect requests are serialized by an external admission queue
//! that keeps one connect in flight per role. The queue invokes
//! [`crate::api::connect`] for the request at its head and waits for an
//! advance token before dispatching the next one. The state machine posts
//! exactly one token per self-initiated connect attempt, whatever its
//! outcome, so a failed attempt never deadlocks the queue.

use crate::QUEUE_CHANNEL;

/// Token telling the admission queue to dispatch its next connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct QueueAdvance;

/// Post one advance token to the admission queue
pub(crate) fn advance() {
    if QUEUE_CHANNEL.try_send(QueueAdvance).is_err() {
        defmt::warn!("[QUEUE] advance channel full");
    }
}

/// Receive the next advance token.
///
/// Intended for the external admission queue's task.
pub async fn next_advance() -> QueueAdvance {
    QUEUE_CHANNEL.receive().await
}
