//! Operation lifecycle: adversary lookup, dedup, creation, start, polling.
//!
//! The control plane offers no push notifications, so everything here is a
//! polling loop driven by the injected [`Clock`].
//!
//! # Dedup
//!
//! Before creating an operation, [`OperationManager::find_recent_running_operation`]
//! looks for a running operation for the same `(adversary_id, group)` that
//! started inside the recency window. If one exists it is reused, so a
//! restarted sequencer does not spawn a duplicate. This is a time-windowed
//! scan, not a lock: two sequencers racing inside one poll interval can
//! still both create.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, Clock};
use crate::client::{ControlPlane, CreateOperation};
use crate::config::OperationConfig;
use crate::error::{KillchainError, Result};
use crate::types::{to_epoch, OperationRef, OperationState, RemoteOperation};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Handle to the operation a job is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedOperation {
    pub id: String,
    /// `true` when an already-running operation was picked up instead of
    /// creating a new one.
    pub reused: bool,
}

/// Terminal observation of a polled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub ok: bool,
    /// Remote terminal state on success, `"timeout"` on deadline.
    pub final_state: String,
    /// Last non-empty state reported before the deadline, if any.
    pub last_observed: Option<String>,
}

// ---------------------------------------------------------------------------
// OperationManager
// ---------------------------------------------------------------------------

pub struct OperationManager<'a, C: ?Sized, K: ?Sized> {
    client: &'a C,
    clock: &'a K,
    cancel: &'a CancelToken,
    cfg: &'a OperationConfig,
}

impl<'a, C, K> OperationManager<'a, C, K>
where
    C: ControlPlane + ?Sized,
    K: Clock + ?Sized,
{
    pub fn new(client: &'a C, clock: &'a K, cancel: &'a CancelToken, cfg: &'a OperationConfig) -> Self {
        Self {
            client,
            clock,
            cancel,
            cfg,
        }
    }

    // -----------------------------------------------------------------------
    // Adversary lookup
    // -----------------------------------------------------------------------

    /// Id of the first adversary whose `name` matches exactly.
    pub fn resolve_adversary_id(&self, name: &str) -> Result<Option<String>> {
        let adversaries = self.client.adversaries()?;
        Ok(adversaries
            .iter()
            .find(|a| a.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|a| a.get("adversary_id"))
            .and_then(crate::types::id_string))
    }

    /// [`resolve_adversary_id`](Self::resolve_adversary_id) retried on the
    /// resolve interval, up to the configured number of attempts.
    pub fn resolve_adversary_id_with_retry(&self, name: &str) -> Result<Option<String>> {
        let attempts = self.cfg.resolve_attempts.max(1);
        for attempt in 1..=attempts {
            self.cancel.check()?;
            if let Some(id) = self.resolve_adversary_id(name)? {
                debug!(attempt, "adversary '{name}' resolved to {id}");
                return Ok(Some(id));
            }
            if attempt < attempts {
                self.clock.sleep(self.cfg.resolve_interval(), self.cancel)?;
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Dedup + creation
    // -----------------------------------------------------------------------

    pub fn list_operations(&self) -> Result<Vec<RemoteOperation>> {
        Ok(RemoteOperation::list_from(&self.client.operations()?))
    }

    /// Latest-started operation for `(adversary_id, group)` that began within
    /// `window` and is still running (state `running`/`started`, or the
    /// completion flag unset).
    pub fn find_recent_running_operation(
        &self,
        adversary_id: &str,
        group: &str,
        window: Duration,
    ) -> Result<Option<RemoteOperation>> {
        let cutoff = to_epoch(self.clock.now()) - window.as_secs_f64();
        let found = self
            .list_operations()?
            .into_iter()
            .filter(|op| op.adversary_id == adversary_id && op.group == group)
            .filter(|op| op.started_at >= cutoff)
            .filter(|op| matches!(op.raw_state.as_str(), "running" | "started") || !op.complete)
            .max_by(|a, b| a.started_at.total_cmp(&b.started_at));
        Ok(found)
    }

    /// Create and start an operation, or reuse a recent running one.
    ///
    /// Fails with [`KillchainError::OperationIdUnresolved`] when the creation
    /// response carries no id and the operation cannot be found by name: an
    /// operation may now exist remotely with no local handle.
    pub fn create_and_start_operation(&self, adversary_id: &str, group: &str) -> Result<StartedOperation> {
        if let Some(existing) =
            self.find_recent_running_operation(adversary_id, group, self.cfg.recent_window())?
        {
            info!(
                "found recent running op id={} (group={group}) -> skip creating",
                existing.id
            );
            return Ok(StartedOperation {
                id: existing.id,
                reused: true,
            });
        }

        let request = CreateOperation {
            index: "operations",
            name: format!("{}-{}", self.cfg.name_prefix, self.clock.now().timestamp()),
            adversary_id: adversary_id.to_string(),
            planner: self.cfg.planner.clone(),
            group: group.to_string(),
            autonomous: u8::from(self.cfg.autonomous),
            auto_close: u8::from(self.cfg.auto_close),
        };
        let response = self.client.create_operation(&request)?;

        let op_ref = match OperationRef::from_response(&response) {
            Some(r) => r,
            None => {
                debug!("no id in create response, looking up '{}' by name", request.name);
                self.find_by_name(&request.name)?
                    .ok_or_else(|| KillchainError::OperationIdUnresolved {
                        name: request.name.clone(),
                        response: response.to_string(),
                    })?
            }
        };

        self.client.set_operation_state(&op_ref.id, "running")?;
        info!(
            "operation started id={} name={} group={group}",
            op_ref.id, request.name
        );
        Ok(StartedOperation {
            id: op_ref.id,
            reused: false,
        })
    }

    fn find_by_name(&self, name: &str) -> Result<Option<OperationRef>> {
        Ok(self
            .list_operations()?
            .into_iter()
            .find(|op| op.name == name && !op.id.is_empty())
            .map(|op| OperationRef { id: op.id }))
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Current view of `op_id`.
    ///
    /// Uses the direct lookup; when that does not answer with an object,
    /// falls back to listing every operation and matching by id. `None` when
    /// the operation cannot be found either way.
    pub fn operation_status(&self, op_id: &str) -> Result<Option<RemoteOperation>> {
        let direct = self.client.operation(op_id)?;
        if let Some(op) = RemoteOperation::from_value(&direct) {
            return Ok(Some(op));
        }
        Ok(self.list_operations()?.into_iter().find(|op| op.id == op_id))
    }

    /// Poll `op_id` until it reports a terminal state or `timeout` elapses.
    ///
    /// Each distinct non-empty state is logged once.
    pub fn poll_until_terminal(&self, op_id: &str, timeout: Duration) -> Result<PollOutcome> {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| self.clock.now().checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut last = String::new();

        while self.clock.now() < deadline {
            self.cancel.check()?;
            let (raw, state) = match self.operation_status(op_id)? {
                Some(op) => (op.raw_state, op.state),
                None => (String::new(), OperationState::NotFound),
            };
            if !raw.is_empty() && raw != last {
                info!("op {op_id} state={raw}");
                last = raw.clone();
            }
            if state == OperationState::Finished {
                let final_state = if raw.is_empty() {
                    OperationState::Finished.to_string()
                } else {
                    raw
                };
                return Ok(PollOutcome {
                    ok: true,
                    final_state,
                    last_observed: None,
                });
            }
            self.clock.sleep(self.cfg.poll_interval(), self.cancel)?;
        }

        warn!("op {op_id} did not finish within {}s", timeout.as_secs());
        Ok(PollOutcome {
            ok: false,
            final_state: OperationState::Timeout.to_string(),
            last_observed: (!last.is_empty()).then_some(last),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
