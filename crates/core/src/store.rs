//! Host store abstraction.
//!
//! The library never talks to a database directly; the hosting application
//! provides a [`Store`] whose sessions expose exactly the operations the
//! outbox and inbox patterns need. All staged writes commit atomically with
//! whatever business writes the host attaches to the same session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use crate::errors::StoreError;

/// One durable outbound message, staged in the same transaction as the
/// business data that caused it.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    /// Monotonically increasing, assigned by the store on insert. Primary
    /// polling order.
    pub sequence_number: i64,
    pub id: Uuid,
    /// Registered type id used to route the row back into a typed pipeline.
    pub compile_type: String,
    pub runtime_type: Option<String>,
    pub topic: String,
    pub aggregate_key: Option<String>,
    /// Header snapshot frozen at enqueue time.
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub is_success: bool,
}

/// One processed-message fingerprint, recorded in the same transaction as
/// the handler's work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRow {
    pub id: Uuid,
    /// Low 64 bits carry the content hash, high 64 bits are zero. Unique
    /// within the retention window (database unique index).
    pub fingerprint: u128,
    pub received_at: DateTime<Utc>,
    /// `received_at + retention` when a retention window is configured.
    /// Reaping expired rows is the application's job.
    pub expired_at: Option<DateTime<Utc>>,
}

/// Outcome of attempting to record an inbox fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxInsert {
    Inserted,
    /// The unique index rejected the fingerprint: the message was already
    /// processed within the retention window.
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a fresh transactional session.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// A transactional unit of work. Dropping a session without committing
/// rolls every staged write back.
#[async_trait]
pub trait StoreSession: Send {
    /// Next value of the monotonic outbox sequence.
    async fn next_outbox_sequence(&mut self) -> Result<i64, StoreError>;

    /// Stage an outbox row; it commits together with the session.
    fn stage_outbox(&mut self, row: OutboxRow);

    /// Record an inbox fingerprint, reporting unique-index violations as
    /// [`InboxInsert::Duplicate`] rather than an error.
    async fn insert_inbox(&mut self, row: InboxRow) -> Result<InboxInsert, StoreError>;

    /// Fetch up to `limit` unpublished outbox rows in sequence order.
    async fn pending_outbox(&mut self, limit: usize) -> Result<Vec<OutboxRow>, StoreError>;

    /// Stage updates to previously fetched outbox rows (matched by id).
    async fn update_outbox(&mut self, rows: &[OutboxRow]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
