//! In-memory submission store
//!
//! Reference implementation backed by a `RwLock`ed map, suitable for tests
//! and single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{MarkTerminal, StoreError, SubmissionStore};
use crate::submission::{Submission, SubmissionStatus, TerminalOutcome};

#[derive(Default)]
struct Inner {
    submissions: HashMap<Uuid, Submission>,
    tokens: HashMap<String, Uuid>,
}

/// In-memory store keyed by submission id with a token index
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert(&self, submission: Submission) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.submissions.contains_key(&submission.id) {
            return Err(StoreError::DuplicateId(submission.id));
        }
        inner
            .tokens
            .insert(submission.token.clone(), submission.id);
        inner.submissions.insert(submission.id, submission);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.submissions.get(&id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Submission>, StoreError> {
        let inner = self.inner.read().await;
        let id = match inner.tokens.get(token) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(inner.submissions.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<Option<Submission>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(submission) = inner.submissions.get_mut(&id) else {
            return Ok(None);
        };
        if !submission.is_terminal() {
            submission.status = status;
        }
        Ok(Some(submission.clone()))
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        outcome: TerminalOutcome,
    ) -> Result<MarkTerminal, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(submission) = inner.submissions.get_mut(&id) else {
            return Ok(MarkTerminal::NotFound);
        };
        if submission.is_terminal() {
            return Ok(MarkTerminal::AlreadyTerminal(submission.clone()));
        }

        if let Some(status) = outcome.status {
            submission.status = status;
        }
        submission.stdout = outcome.stdout;
        submission.stderr = outcome.stderr;
        submission.compile_output = outcome.compile_output;
        submission.exit_code = outcome.exit_code;
        submission.exit_signal = outcome.exit_signal;
        submission.time = outcome.time;
        submission.wall_time = outcome.wall_time;
        submission.memory = outcome.memory;
        submission.message = outcome.message;
        submission.finished_at = Some(Utc::now());

        Ok(MarkTerminal::Applied(submission.clone()))
    }

    async fn list_in_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>, StoreError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<Submission> = inner
            .submissions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }
}
