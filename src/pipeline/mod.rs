//! Routing engine: one fetched message in, exactly one recorded outcome out.
//!
//! 1. Skip messages that already have an outcome for this account
//! 2. Parse `<keyword> - <target>` from the subject
//! 3. Resolve the target by exact name
//! 4. Deliver through the owning account's transport
//!
//! Every failure after step 1 becomes a `failed` outcome; nothing is retried.

pub mod subject;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ForwardMode;
use crate::error::{DatabaseError, RoutingError};
use crate::model::{DispatchOutcome, NormalizedMessage};
use crate::store::{AuditLog, Directory};
use crate::transport::{Deliverer, Outbound};

/// What `Router::process` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// An outcome already existed; nothing was sent or recorded.
    Skipped,
    Forwarded { to: String },
    Failed { reason: String },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Forwarded { .. } => "forwarded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Stateless apart from its collaborators; shared by every poll task.
pub struct Router {
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditLog>,
    mode: ForwardMode,
}

impl Router {
    pub fn new(directory: Arc<dyn Directory>, audit: Arc<dyn AuditLog>, mode: ForwardMode) -> Self {
        Self {
            directory,
            audit,
            mode,
        }
    }

    /// Route one message fetched for `account_id`.
    ///
    /// Only store errors are returned; routing and delivery failures are
    /// recorded as outcomes.
    pub async fn process(
        &self,
        message: &NormalizedMessage,
        account_id: i64,
        deliverer: &dyn Deliverer,
    ) -> Result<ProcessOutcome, DatabaseError> {
        if self
            .audit
            .find_outcome(account_id, &message.message_id)
            .await?
            .is_some()
        {
            debug!(account_id, message_id = %message.message_id, "Already processed, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        let parsed = match subject::parse(&message.subject) {
            Ok(parsed) => parsed,
            Err(e) => {
                let outcome = DispatchOutcome::failed(
                    account_id,
                    message,
                    None,
                    format!("subject parse failed: {e}"),
                );
                return self.record(outcome).await;
            }
        };

        let target = match self.directory.lookup_target(parsed.target).await? {
            Some(target) => target,
            None => {
                let e = RoutingError::TargetNotFound {
                    name: parsed.target.to_string(),
                };
                debug!(account_id, message_id = %message.message_id, error = %e, "No route");
                let outcome = DispatchOutcome::failed(
                    account_id,
                    message,
                    None,
                    format!("target not found: {}", parsed.target),
                );
                return self.record(outcome).await;
            }
        };

        let outbound = Outbound {
            message,
            mode: self.mode,
        };
        let outcome = match deliverer.deliver(outbound, &target.email).await {
            Ok(()) => DispatchOutcome::forwarded(account_id, message, &target.email),
            Err(e) => DispatchOutcome::failed(
                account_id,
                message,
                Some(&target.email),
                format!("forward failed: {e}"),
            ),
        };
        self.record(outcome).await
    }

    async fn record(&self, outcome: DispatchOutcome) -> Result<ProcessOutcome, DatabaseError> {
        if !self.audit.append_outcome(&outcome).await? {
            warn!(
                account_id = outcome.account_id,
                message_id = %outcome.message_id,
                "Outcome already recorded by a concurrent task"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let result = match (&outcome.forward_to, &outcome.error) {
            (_, Some(reason)) => ProcessOutcome::Failed {
                reason: reason.clone(),
            },
            (Some(to), None) => ProcessOutcome::Forwarded { to: to.clone() },
            (None, None) => ProcessOutcome::Failed {
                reason: String::new(),
            },
        };

        match &result {
            ProcessOutcome::Forwarded { to } => info!(
                account_id = outcome.account_id,
                message_id = %outcome.message_id,
                to = %to,
                "Dispatched"
            ),
            ProcessOutcome::Failed { reason } => warn!(
                account_id = outcome.account_id,
                message_id = %outcome.message_id,
                subject = %outcome.subject,
                reason = %reason,
                "Dispatch failed"
            ),
            ProcessOutcome::Skipped => {}
        }
        Ok(result)
    }
}
