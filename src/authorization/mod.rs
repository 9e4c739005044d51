//! One-at-a-time sequencing of third-party consent steps.
//!
//! Backend replies can list providers that need the user's consent before a
//! workflow may run. [`AuthorizationSequencer`] walks that list strictly in
//! arrival order, never presenting two consents at once, and reports once
//! when everything in the batch is satisfied.

use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Completed requirements stay visible this long.
pub const DEFAULT_COMPLETED_EXPIRY: Duration = Duration::from_secs(3);

/// One entry of a reply's `oauth_requirements` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub service_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl RequirementStatus {
    /// Still blocking the workflow.
    #[must_use]
    pub fn is_outstanding(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequirement {
    /// Provider identity; the service id.
    pub id: String,
    pub display_name: String,
    pub scopes: BTreeSet<String>,
    pub authorization_url: Option<String>,
    pub status: RequirementStatus,
    pub error: Option<String>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AuthorizationRequirement {
    fn from_request(request: AuthorizationRequest) -> Self {
        let display_name = if request.display_name.trim().is_empty() {
            request.service_id.clone()
        } else {
            request.display_name
        };
        Self {
            id: request.service_id,
            display_name,
            scopes: request.scopes.into_iter().collect(),
            authorization_url: request.authorization_url,
            status: RequirementStatus::Pending,
            error: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("Unknown authorization requirement: {0}")]
    Unknown(String),

    #[error("Cannot {action} requirement {id} while it is {status:?}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: RequirementStatus,
    },
}

/// Sequencer events. Every method has a no-op default.
pub trait SequencerObserver: Send + Sync {
    /// A requirement became the one being processed.
    fn on_started(&self, _requirement: &AuthorizationRequirement) {}
    /// A requirement failed; the queue is halted until retry or dismiss.
    fn on_failed(&self, _requirement: &AuthorizationRequirement) {}
    /// Everything in the batch is satisfied. Ids in completion order.
    fn on_all_completed(&self, _completed: &[String]) {}
}

pub struct AuthorizationSequencer {
    queue: Vec<AuthorizationRequirement>,
    /// Ids completed since the last all-completed event.
    batch: Vec<String>,
    /// Set when the user dismissed a requirement from the current batch.
    abandoned: bool,
    observers: Vec<Arc<dyn SequencerObserver>>,
    clock: Arc<dyn Clock>,
    completed_expiry: Duration,
}

impl Default for AuthorizationSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETED_EXPIRY)
    }
}

impl AuthorizationSequencer {
    #[must_use]
    pub fn new(completed_expiry: Duration) -> Self {
        Self {
            queue: Vec::new(),
            batch: Vec::new(),
            abandoned: false,
            observers: Vec::new(),
            clock: Arc::new(SystemClock),
            completed_expiry,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn SequencerObserver>) {
        self.observers.push(observer);
    }

    /// Add requirements in arrival order.
    ///
    /// A requirement whose provider is already queued is merged into the
    /// existing entry instead of being added twice. A completed provider is
    /// reopened only when the new request asks for scopes it did not cover.
    /// Returns how many entries were added or reopened.
    pub fn enqueue(&mut self, requests: impl IntoIterator<Item = AuthorizationRequest>) -> usize {
        self.purge_expired();

        let mut added = 0;
        for request in requests {
            if request.service_id.trim().is_empty() {
                warn!("ignoring authorization requirement without a service id");
                continue;
            }

            let Some(index) = self.position(&request.service_id) else {
                debug!(id = %request.service_id, "authorization requirement queued");
                self.queue.push(AuthorizationRequirement::from_request(request));
                added += 1;
                continue;
            };

            let existing = &mut self.queue[index];
            let covered = request.scopes.iter().all(|s| existing.scopes.contains(s));
            existing.scopes.extend(request.scopes);
            if existing.authorization_url.is_none() {
                existing.authorization_url = request.authorization_url;
            }

            if existing.status == RequirementStatus::Completed && !covered {
                debug!(id = %existing.id, "completed requirement reopened for new scopes");
                let mut reopened = self.queue.remove(index);
                reopened.status = RequirementStatus::Pending;
                reopened.completed_at = None;
                self.batch.retain(|id| id != &reopened.id);
                self.queue.push(reopened);
                added += 1;
            }
        }

        self.advance();
        added
    }

    /// The requirement to present now, starting the next pending one if the
    /// queue is idle. `None` when halted on an error or nothing is pending.
    pub fn next(&mut self) -> Option<AuthorizationRequirement> {
        self.purge_expired();
        self.advance();
        self.current().cloned()
    }

    #[must_use]
    pub fn current(&self) -> Option<&AuthorizationRequirement> {
        self.queue
            .iter()
            .find(|r| r.status == RequirementStatus::Processing)
    }

    /// Mark the requirement being processed as satisfied and move on to the
    /// next one. Completing an already completed requirement is a no-op.
    pub fn complete(&mut self, id: &str) -> Result<(), SequencerError> {
        let index = self.index_of(id)?;
        let requirement = &mut self.queue[index];
        match requirement.status {
            RequirementStatus::Processing => {}
            RequirementStatus::Completed => return Ok(()),
            status @ (RequirementStatus::Pending | RequirementStatus::Error) => {
                return Err(SequencerError::InvalidTransition {
                    id: id.to_string(),
                    action: "complete",
                    status,
                });
            }
        }

        requirement.status = RequirementStatus::Completed;
        requirement.error = None;
        requirement.completed_at = Some(self.clock.now());
        info!(id, "authorization completed");
        self.batch.push(id.to_string());

        self.advance();
        Ok(())
    }

    /// Mark the requirement being processed as failed. The queue halts
    /// until it is retried or dismissed.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<(), SequencerError> {
        let index = self.index_of(id)?;
        let requirement = &mut self.queue[index];
        if requirement.status != RequirementStatus::Processing {
            return Err(SequencerError::InvalidTransition {
                id: id.to_string(),
                action: "fail",
                status: requirement.status,
            });
        }

        requirement.status = RequirementStatus::Error;
        requirement.error = Some(error.into());
        warn!(id, error = ?requirement.error, "authorization failed");

        let failed = requirement.clone();
        for observer in &self.observers {
            observer.on_failed(&failed);
        }
        Ok(())
    }

    /// Put a failed requirement back in line. It keeps its place in the
    /// queue, so it is the next one processed.
    pub fn retry(&mut self, id: &str) -> Result<(), SequencerError> {
        let index = self.index_of(id)?;
        let requirement = &mut self.queue[index];
        if requirement.status != RequirementStatus::Error {
            return Err(SequencerError::InvalidTransition {
                id: id.to_string(),
                action: "retry",
                status: requirement.status,
            });
        }

        requirement.status = RequirementStatus::Pending;
        requirement.error = None;
        self.advance();
        Ok(())
    }

    /// Cancel whatever is being processed. Treated as a failure, so the
    /// queue halts rather than skipping ahead.
    pub fn cancel_current(&mut self) -> Result<(), SequencerError> {
        match self.current().map(|r| r.id.clone()) {
            Some(id) => self.fail(&id, "cancelled"),
            None => Ok(()),
        }
    }

    /// Drop a pending or failed requirement the user chose not to grant.
    ///
    /// The batch no longer counts as fully satisfied, so no all-completed
    /// event fires for it.
    pub fn dismiss(&mut self, id: &str) -> Result<(), SequencerError> {
        let index = self.index_of(id)?;
        let status = self.queue[index].status;
        if matches!(
            status,
            RequirementStatus::Processing | RequirementStatus::Completed
        ) {
            return Err(SequencerError::InvalidTransition {
                id: id.to_string(),
                action: "dismiss",
                status,
            });
        }

        self.queue.remove(index);
        self.abandoned = true;
        debug!(id, "authorization requirement dismissed");
        self.advance();
        Ok(())
    }

    /// No requirement is pending, processing or failed.
    #[must_use]
    pub fn is_all_satisfied(&self) -> bool {
        !self.queue.iter().any(|r| r.status.is_outstanding())
    }

    /// Halted on a failed requirement.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.queue
            .iter()
            .any(|r| r.status == RequirementStatus::Error)
    }

    /// Snapshot of the visible queue; expired completions are left out.
    #[must_use]
    pub fn requirements(&self) -> Vec<AuthorizationRequirement> {
        let now = self.clock.now();
        self.queue
            .iter()
            .filter(|r| !expired(r, now, self.completed_expiry))
            .cloned()
            .collect()
    }

    /// Drop completed requirements older than the expiry window.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let expiry = self.completed_expiry;
        let before = self.queue.len();
        self.queue.retain(|r| !expired(r, now, expiry));
        before - self.queue.len()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|r| r.id == id)
    }

    fn index_of(&self, id: &str) -> Result<usize, SequencerError> {
        self.position(id)
            .ok_or_else(|| SequencerError::Unknown(id.to_string()))
    }

    /// Start the first pending requirement if nothing is processing and the
    /// queue is not halted; fire the batch event once nothing is outstanding.
    fn advance(&mut self) {
        if self.queue.iter().any(|r| {
            matches!(
                r.status,
                RequirementStatus::Processing | RequirementStatus::Error
            )
        }) {
            return;
        }

        if let Some(next) = self
            .queue
            .iter_mut()
            .find(|r| r.status == RequirementStatus::Pending)
        {
            next.status = RequirementStatus::Processing;
            debug!(id = %next.id, "authorization started");
            let started = next.clone();
            for observer in &self.observers {
                observer.on_started(&started);
            }
            return;
        }

        let completed = std::mem::take(&mut self.batch);
        let abandoned = std::mem::replace(&mut self.abandoned, false);
        if completed.is_empty() || abandoned {
            return;
        }

        info!(count = completed.len(), "all authorizations completed");
        for observer in &self.observers {
            observer.on_all_completed(&completed);
        }
    }
}

fn expired(
    requirement: &AuthorizationRequirement,
    now: chrono::DateTime<chrono::Utc>,
    expiry: Duration,
) -> bool {
    let Some(completed_at) = requirement.completed_at else {
        return false;
    };
    let expiry = chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::zero());
    now - completed_at >= expiry
}
