// Transaction lifecycle event sink.
//
// Events are emitted per session in order: begin, start of phase two, end of
// phase two. Delivery is fire-and-forget; the sink owns its own buffering.

use serde::Serialize;

use crate::common::TransactionId;
use crate::session::GlobalStatus;

/// Role tag carried by coordinator-emitted events.
pub const TC_ROLE: &str = "tc";

/// One lifecycle event of a global transaction.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalTransactionEvent {
    pub transaction_id: TransactionId,
    /// Emitting role, always [`TC_ROLE`] for this core.
    pub role: &'static str,
    /// Transaction name supplied at begin.
    pub name: String,
    /// Epoch milliseconds at begin.
    pub begin_time: i64,
    /// Epoch milliseconds at end of phase two; `None` until then.
    pub end_time: Option<i64>,
    pub status: GlobalStatus,
}

/// Receiver of transaction lifecycle events.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn publish(&self, event: GlobalTransactionEvent);
}

/// Event sink that writes events to the tracing log.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: GlobalTransactionEvent) {
        tracing::info!(
            transaction_id = event.transaction_id,
            name = %event.name,
            status = ?event.status,
            end_time = ?event.end_time,
            "global transaction event"
        );
    }
}
