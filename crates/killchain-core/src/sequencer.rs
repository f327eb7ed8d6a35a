//! Ordered execution of the resolved kill-chain jobs.
//!
//! ```text
//! wait_until_reachable
//!     │
//!     ▼
//! for each job ──► AgentGate ──► resolve adversary ──► create/reuse ──► poll
//!     │                              │ not found
//!     │                              ▼
//!     │                        failed outcome (stop_on_fail → break)
//!     ▼
//! SequenceReport
//! ```
//!
//! Exactly one operation is in flight at any time. Fatal errors (retry
//! exhaustion, an unresolvable operation id) and cancellation propagate as
//! `Err`; the caller decides whether the process exits.

use std::cell::RefCell;

use tracing::info;

use crate::cancel::{CancelToken, Clock};
use crate::client::{ControlPlane, Liveness};
use crate::config::Config;
use crate::error::Result;
use crate::gate::AgentGate;
use crate::lifecycle::OperationManager;
use crate::probe::wait_until_reachable;
use crate::types::{AdversaryJob, SequenceOutcome, SequenceReport};

pub struct Sequencer<'a, C: ?Sized, L: ?Sized, K: ?Sized> {
    client: &'a C,
    liveness: &'a L,
    clock: &'a K,
    cancel: &'a CancelToken,
    cfg: &'a Config,
    in_flight: RefCell<Option<String>>,
}

impl<'a, C, L, K> Sequencer<'a, C, L, K>
where
    C: ControlPlane + ?Sized,
    L: Liveness + ?Sized,
    K: Clock + ?Sized,
{
    pub fn new(
        client: &'a C,
        liveness: &'a L,
        clock: &'a K,
        cancel: &'a CancelToken,
        cfg: &'a Config,
    ) -> Self {
        Self {
            client,
            liveness,
            clock,
            cancel,
            cfg,
            in_flight: RefCell::new(None),
        }
    }

    /// Id of the operation being polled, if any. Set while a job is waiting
    /// on its operation and cleared once the outcome is recorded, so a
    /// cancelled run can report what it left behind on the control plane.
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.borrow().clone()
    }

    /// Run every job in order and return the per-job outcomes.
    ///
    /// An empty job list returns a successful report without touching the
    /// control plane.
    pub fn run(&self, jobs: &[AdversaryJob]) -> Result<SequenceReport> {
        let mut report = SequenceReport {
            planned: jobs.len(),
            outcomes: Vec::with_capacity(jobs.len()),
        };
        if jobs.is_empty() {
            info!("no adversaries enabled -> nothing to run");
            return Ok(report);
        }

        info!("waiting control plane");
        wait_until_reachable(
            self.liveness,
            self.clock,
            self.cancel,
            self.cfg.control_plane.probe_interval(),
        )?;

        let gate = AgentGate::new(
            self.cfg.sequence.require_agent,
            self.cfg.operation.poll_interval(),
        );
        let ops = OperationManager::new(self.client, self.clock, self.cancel, &self.cfg.operation);
        let total = jobs.len();

        for (i, job) in jobs.iter().enumerate() {
            let n = i + 1;
            info!(
                "=== [{n}/{total}] adversary: {} (group={}) ===",
                job.name, job.group
            );

            gate.wait_for_agent(self.client, self.clock, self.cancel, &job.group)?;

            let Some(adversary_id) = ops.resolve_adversary_id_with_retry(&job.name)? else {
                info!("adversary '{}' not found", job.name);
                report.outcomes.push(SequenceOutcome::not_found(job));
                if self.cfg.sequence.stop_on_fail {
                    info!("stop_on_fail set -> aborting remaining sequence");
                    break;
                }
                continue;
            };

            let started = ops.create_and_start_operation(&adversary_id, &job.group)?;
            *self.in_flight.borrow_mut() = Some(started.id.clone());

            let poll = ops.poll_until_terminal(&started.id, self.cfg.operation.timeout())?;
            self.in_flight.borrow_mut().take();

            info!(
                "adversary '{}' done -> ok={} state={} (group={})",
                job.name, poll.ok, poll.final_state, job.group
            );
            report.outcomes.push(SequenceOutcome {
                adversary_name: job.name.clone(),
                group: job.group.clone(),
                ok: poll.ok,
                final_state: poll.final_state,
                operation_id: Some(started.id),
                reused: started.reused,
                last_observed: poll.last_observed,
            });

            if n < total {
                self.clock
                    .sleep(self.cfg.sequence.delay_between(), self.cancel)?;
            }
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KillchainError;
    use crate::testing::{FakeControlPlane, ManualClock};
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    fn cfg(stop_on_fail: bool) -> Config {
        let mut cfg = Config::default();
        cfg.sequence.stop_on_fail = stop_on_fail;
        cfg.operation.resolve_attempts = 2;
        cfg.operation.timeout_secs = 30;
        cfg
    }

    fn jobs(names: &[(&str, &str)]) -> Vec<AdversaryJob> {
        names
            .iter()
            .enumerate()
            .map(|(i, (n, g))| AdversaryJob::new(*n, *g, i + 1))
            .collect()
    }

    fn plane() -> FakeControlPlane {
        let fake = FakeControlPlane::new()
            .with_adversaries(json!([
                {"name": "KC1", "adversary_id": "a-1"},
                {"name": "KC2", "adversary_id": "a-2"},
            ]))
            .with_agents(json!([{"paw": "p", "group": "red"}, {"paw": "q", "group": "blue"}]));
        fake.operations.set(vec![json!([])]);
        fake.lookups.set(vec![json!({"state": "finished"})]);
        fake
    }

    #[test]
    fn empty_job_list_succeeds_without_traffic() {
        let fake = plane();
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&[]).unwrap();

        assert!(report.success());
        assert!(report.outcomes.is_empty());
        assert!(fake.calls().is_empty());
        assert_eq!(fake.probes(), 0);
    }

    #[test]
    fn runs_jobs_in_order_with_delay_between() {
        let fake = plane();
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&jobs(&[("KC1", "red"), ("KC2", "blue")])).unwrap();

        assert!(report.success());
        let names: Vec<_> = report.outcomes.iter().map(|o| o.adversary_name.as_str()).collect();
        assert_eq!(names, vec!["KC1", "KC2"]);
        assert_eq!(report.outcomes[0].operation_id.as_deref(), Some("100"));
        assert_eq!(report.outcomes[1].operation_id.as_deref(), Some("101"));
        assert_eq!(report.outcomes[1].group, "blue");

        let creates = fake.creates();
        assert_eq!(creates[0]["adversary_id"], "a-1");
        assert_eq!(creates[1]["adversary_id"], "a-2");
        // only the delay between the two jobs
        assert_eq!(clock.slept(), Duration::from_secs(2));
        assert!(seq.in_flight().is_none());
    }

    #[test]
    fn stop_on_fail_aborts_after_unresolved_adversary() {
        let fake = plane();
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&jobs(&[("ghost", "red"), ("KC1", "red")])).unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert!(!report.outcomes[0].ok);
        assert_eq!(report.outcomes[0].final_state, "not-found");
        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
        assert!(fake.creates().is_empty());
    }

    #[test]
    fn continue_on_fail_runs_remaining_jobs() {
        let fake = plane();
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(false));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&jobs(&[("ghost", "red"), ("KC1", "red")])).unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].ok);
        assert!(report.outcomes[1].ok);
        assert!(!report.success());
        assert_eq!(fake.creates().len(), 1);
    }

    #[test]
    fn timeout_fails_job_but_sequence_continues() {
        let fake = plane();
        // 9s timeout at a 3s poll interval: the first job reads three times.
        fake.lookups.set(vec![
            json!({"state": "running"}),
            json!({"state": "running"}),
            json!({"state": "running"}),
            json!({"state": "success"}),
        ]);
        let (clock, cancel, mut cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        cfg.operation.timeout_secs = 9;
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&jobs(&[("KC1", "red"), ("KC2", "red")])).unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].final_state, "timeout");
        assert_eq!(report.outcomes[0].last_observed.as_deref(), Some("running"));
        assert!(report.outcomes[1].ok);
        assert_eq!(report.outcomes[1].final_state, "success");
        assert!(!report.success());
    }

    #[test]
    fn reused_operation_is_reported() {
        let clock = ManualClock::new();
        let fake = plane();
        fake.operations.set(vec![json!([{
            "id": 77, "adversary_id": "a-1", "group": "red",
            "state": "running", "start": clock.epoch() - 60.0,
        }])]);
        let (cancel, cfg) = (CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let report = seq.run(&jobs(&[("KC1", "red")])).unwrap();

        assert!(report.outcomes[0].reused);
        assert_eq!(report.outcomes[0].operation_id.as_deref(), Some("77"));
        assert!(fake.creates().is_empty());
    }

    #[test]
    fn waits_for_control_plane_before_any_call() {
        let fake = plane();
        fake.reachable_after.set(2);
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        seq.run(&jobs(&[("KC1", "red")])).unwrap();

        assert_eq!(fake.probes(), 3);
        let (method, first) = &fake.calls()[0];
        assert_eq!(*method, Method::POST);
        assert_eq!(first["index"], "agents");
    }

    #[test]
    fn fatal_client_error_aborts_run() {
        let fake = plane();
        fake.broken.set(true);
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let err = seq.run(&jobs(&[("KC1", "red")])).unwrap_err();
        assert!(matches!(err, KillchainError::RetriesExhausted { .. }));
    }

    #[test]
    fn unresolvable_operation_id_aborts_whole_run() {
        let fake = plane();
        *fake.create_response.borrow_mut() = Some(json!({}));
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(false));
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let err = seq
            .run(&jobs(&[("KC1", "red"), ("KC2", "red")]))
            .unwrap_err();
        assert!(matches!(err, KillchainError::OperationIdUnresolved { .. }));
        assert_eq!(fake.creates().len(), 1);
    }

    #[test]
    fn cancellation_mid_poll_leaves_operation_in_flight() {
        let fake = plane();
        fake.lookups.set(vec![json!({"state": "running"})]);
        let (clock, cancel, cfg) = (ManualClock::new(), CancelToken::new(), cfg(true));
        clock.cancel_after(2, cancel.clone());
        let seq = Sequencer::new(&fake, &fake, &clock, &cancel, &cfg);

        let err = seq.run(&jobs(&[("KC1", "red")])).unwrap_err();

        assert!(matches!(err, KillchainError::Cancelled));
        assert_eq!(seq.in_flight().as_deref(), Some("100"));
    }
}
