//! Submission store interface
//!
//! The engine treats the store as the durable work table: intake inserts
//! queued records, the dispatcher and executor transition them, and readers
//! observe linearizable `queued → running → terminal` status changes. The
//! engine only requires that these operations are atomic with respect to
//! concurrent readers; the backing schema is the store's business.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use crate::store::memory::MemoryStore;
use crate::submission::{Submission, SubmissionStatus, TerminalOutcome};

mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission {0} already exists")]
    DuplicateId(Uuid),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Result of an atomic terminal transition
#[derive(Debug)]
pub enum MarkTerminal {
    /// The transition was applied; the updated record is returned
    Applied(Submission),

    /// The submission was already terminal; the existing record is returned
    /// untouched
    AlreadyTerminal(Submission),

    /// No submission with that id exists
    NotFound,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert a freshly queued submission
    async fn insert(&self, submission: Submission) -> Result<(), StoreError>;

    /// Fetch by internal id
    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError>;

    /// Fetch by public token
    async fn get_by_token(&self, token: &str) -> Result<Option<Submission>, StoreError>;

    /// Atomic status transition for a live submission.
    ///
    /// Terminal records are never modified; the current record is returned
    /// unchanged instead. Unknown ids are a no-op returning None.
    async fn set_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<Option<Submission>, StoreError>;

    /// Atomic terminal transition applying the outcome fields and stamping
    /// `finished_at`. Rejected if the submission is already terminal.
    async fn mark_terminal(
        &self,
        id: Uuid,
        outcome: TerminalOutcome,
    ) -> Result<MarkTerminal, StoreError>;

    /// List submissions currently in the given status (used for restart
    /// reconciliation)
    async fn list_in_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>, StoreError>;
}
