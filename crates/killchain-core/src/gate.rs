use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::cancel::{CancelToken, Clock};
use crate::client::ControlPlane;
use crate::error::Result;

// ---------------------------------------------------------------------------
// AgentGate
// ---------------------------------------------------------------------------

/// Precondition checked before each job: an agent must be registered in the
/// job's group.
///
/// There is no timeout. A missing agent is an operator problem; the gate
/// waits until one shows up or the run is cancelled.
#[derive(Debug, Clone)]
pub struct AgentGate {
    pub required: bool,
    pub poll_interval: Duration,
}

impl AgentGate {
    pub fn new(required: bool, poll_interval: Duration) -> Self {
        Self {
            required,
            poll_interval,
        }
    }

    /// Block until at least one agent reports membership in `group`.
    pub fn wait_for_agent<C, K>(
        &self,
        client: &C,
        clock: &K,
        cancel: &CancelToken,
        group: &str,
    ) -> Result<()>
    where
        C: ControlPlane + ?Sized,
        K: Clock + ?Sized,
    {
        if !self.required {
            return Ok(());
        }
        info!("waiting agent in group: {group}");
        loop {
            cancel.check()?;
            let agents = client.agents()?;
            let count = agents_in_group(&agents, group);
            if count > 0 {
                info!(agents = count, "agent found in group {group}");
                return Ok(());
            }
            clock.sleep(self.poll_interval, cancel)?;
        }
    }
}

/// Number of agents in `agents` whose `group` equals `group`.
pub fn agents_in_group(agents: &[Value], group: &str) -> usize {
    agents
        .iter()
        .filter(|agent| agent.get("group").and_then(Value::as_str) == Some(group))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
