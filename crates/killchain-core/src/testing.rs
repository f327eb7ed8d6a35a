//! In-memory control plane and manual clock shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde_json::{json, Value};

use crate::cancel::{CancelToken, Clock};
use crate::client::{ControlPlane, Liveness};
use crate::error::{KillchainError, Result};

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock whose time only moves when something sleeps on it.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    slept: Mutex<Duration>,
    sleeps: Mutex<u32>,
    /// Trip this token once `sleeps` reaches the given count.
    cancel_after: Mutex<Option<(u32, CancelToken)>>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    pub(crate) fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            slept: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    pub(crate) fn slept(&self) -> Duration {
        *self.slept.lock().unwrap()
    }

    pub(crate) fn sleeps(&self) -> u32 {
        *self.sleeps.lock().unwrap()
    }

    pub(crate) fn epoch(&self) -> f64 {
        crate::types::to_epoch(self.now())
    }

    pub(crate) fn cancel_after(&self, sleeps: u32, token: CancelToken) {
        *self.cancel_after.lock().unwrap() = Some((sleeps, token));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        *self.now.lock().unwrap() += chrono::Duration::from_std(duration).unwrap();
        *self.slept.lock().unwrap() += duration;
        let count = {
            let mut sleeps = self.sleeps.lock().unwrap();
            *sleeps += 1;
            *sleeps
        };
        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if count >= *limit {
                token.cancel();
            }
        }
        cancel.check()
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// Sequence of responses; the last one repeats forever.
#[derive(Default)]
pub(crate) struct Script(RefCell<VecDeque<Value>>);

impl Script {
    pub(crate) fn set(&self, responses: Vec<Value>) {
        *self.0.borrow_mut() = responses.into();
    }

    fn next(&self) -> Value {
        let mut queue = self.0.borrow_mut();
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Value::Null)
        } else {
            queue.front().cloned().unwrap_or(Value::Null)
        }
    }
}

// ---------------------------------------------------------------------------
// FakeControlPlane
// ---------------------------------------------------------------------------

/// Scripted [`ControlPlane`] that records every call it receives.
#[derive(Default)]
pub(crate) struct FakeControlPlane {
    pub(crate) adversaries: Script,
    pub(crate) agents: Script,
    pub(crate) operations: Script,
    /// Responses to `{index: "operation", op_id}` lookups.
    pub(crate) lookups: Script,
    /// Response to the creation `PUT`; defaults to `{"id": <n>}`.
    pub(crate) create_response: RefCell<Option<Value>>,
    /// When set, every call fails as if the retries were exhausted.
    pub(crate) broken: Cell<bool>,
    pub(crate) reachable_after: Cell<u32>,
    probes: Cell<u32>,
    next_id: Cell<u64>,
    calls: RefCell<Vec<(Method, Value)>>,
}

impl FakeControlPlane {
    pub(crate) fn new() -> Self {
        let fake = Self::default();
        fake.next_id.set(100);
        fake
    }

    pub(crate) fn with_adversaries(self, advs: Value) -> Self {
        self.adversaries.set(vec![advs]);
        self
    }

    pub(crate) fn with_agents(self, agents: Value) -> Self {
        self.agents.set(vec![agents]);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(Method, Value)> {
        self.calls.borrow().clone()
    }

    pub(crate) fn calls_to(&self, index: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|(_, p)| p["index"] == index)
            .count()
    }

    pub(crate) fn creates(&self) -> Vec<Value> {
        self.calls
            .borrow()
            .iter()
            .filter(|(m, _)| *m == Method::PUT)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub(crate) fn starts(&self) -> Vec<Value> {
        self.calls
            .borrow()
            .iter()
            .filter(|(_, p)| p["index"] == "operation" && p.get("state").is_some())
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub(crate) fn probes(&self) -> u32 {
        self.probes.get()
    }
}

impl ControlPlane for FakeControlPlane {
    fn call(&self, payload: &Value, method: Method) -> Result<Value> {
        self.calls.borrow_mut().push((method.clone(), payload.clone()));
        if self.broken.get() {
            return Err(KillchainError::RetriesExhausted {
                attempts: 1,
                last_error: "connection refused".into(),
            });
        }
        let index = payload["index"].as_str().unwrap_or_default();
        let response = match index {
            "operations" if method == Method::PUT => {
                let scripted = self.create_response.borrow().clone();
                scripted.unwrap_or_else(|| {
                    let id = self.next_id.get();
                    self.next_id.set(id + 1);
                    json!({ "id": id, "name": payload["name"] })
                })
            }
            "adversaries" => self.adversaries.next(),
            "agents" => self.agents.next(),
            "operations" => self.operations.next(),
            "operation" if payload.get("state").is_some() => json!({}),
            "operation" => self.lookups.next(),
            _ => Value::Null,
        };
        Ok(response)
    }
}

impl Liveness for FakeControlPlane {
    fn is_reachable(&self) -> bool {
        let n = self.probes.get() + 1;
        self.probes.set(n);
        n > self.reachable_after.get()
    }
}
