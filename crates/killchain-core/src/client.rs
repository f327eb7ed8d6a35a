//! REST client for the control plane.
//!
//! Every logical operation is a JSON payload with an `index` discriminator
//! sent to the single `<base>/api/rest` endpoint. Reads go out as `POST`,
//! creation as `PUT`.
//!
//! [`ControlPlane`] is the seam the rest of the crate talks to: implementors
//! provide [`ControlPlane::call`]; the typed helpers are default methods on
//! top of it.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Clock, SystemClock};
use crate::config::ControlPlaneConfig;
use crate::error::{KillchainError, Result};

const REST_PATH: &str = "/api/rest";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// CreateOperation
// ---------------------------------------------------------------------------

/// Body of the operation creation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOperation {
    pub index: &'static str,
    pub name: String,
    pub adversary_id: String,
    pub planner: String,
    pub group: String,
    /// Sent as `0`/`1`, the form the control plane expects.
    pub autonomous: u8,
    pub auto_close: u8,
}

// ---------------------------------------------------------------------------
// ControlPlane
// ---------------------------------------------------------------------------

pub trait ControlPlane {
    /// Perform one logical exchange. Implementations own retry policy; an
    /// `Err` here is fatal to the run.
    fn call(&self, payload: &Value, method: Method) -> Result<Value>;

    /// List a resource. Non-list responses are treated as an empty list.
    fn list(&self, index: &str) -> Result<Vec<Value>> {
        match self.call(&json!({ "index": index }), Method::POST)? {
            Value::Array(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    fn adversaries(&self) -> Result<Vec<Value>> {
        self.list("adversaries")
    }

    fn agents(&self) -> Result<Vec<Value>> {
        self.list("agents")
    }

    fn operations(&self) -> Result<Vec<Value>> {
        self.list("operations")
    }

    /// Direct lookup of one operation. The raw response is returned because
    /// some servers answer with a list or nothing useful here.
    fn operation(&self, op_id: &str) -> Result<Value> {
        self.call(
            &json!({ "index": "operation", "op_id": op_id }),
            Method::POST,
        )
    }

    fn create_operation(&self, request: &CreateOperation) -> Result<Value> {
        self.call(&serde_json::to_value(request)?, Method::PUT)
    }

    fn set_operation_state(&self, op_id: &str, state: &str) -> Result<Value> {
        self.call(
            &json!({ "index": "operation", "op_id": op_id, "state": state }),
            Method::POST,
        )
    }
}

impl<C: ControlPlane + ?Sized> ControlPlane for &C {
    fn call(&self, payload: &Value, method: Method) -> Result<Value> {
        (**self).call(payload, method)
    }
}

/// Liveness check used by the availability prober.
pub trait Liveness {
    /// `true` when the control plane answered with a 2xx-4xx status.
    fn is_reachable(&self) -> bool;
}

impl<L: Liveness + ?Sized> Liveness for &L {
    fn is_reachable(&self) -> bool {
        (**self).is_reachable()
    }
}

// ---------------------------------------------------------------------------
// RestClient
// ---------------------------------------------------------------------------

/// Blocking HTTP implementation of [`ControlPlane`] with fixed-delay retry.
pub struct RestClient<K: Clock = SystemClock> {
    http: Client,
    probe: Client,
    base_url: String,
    api_key: Option<String>,
    retries: u32,
    retry_delay: Duration,
    clock: K,
    cancel: CancelToken,
}

impl RestClient<SystemClock> {
    pub fn new(cfg: &ControlPlaneConfig, cancel: CancelToken) -> Result<Self> {
        Self::with_clock(cfg, cancel, SystemClock)
    }
}

impl<K: Clock> RestClient<K> {
    pub fn with_clock(cfg: &ControlPlaneConfig, cancel: CancelToken, clock: K) -> Result<Self> {
        let base_url = cfg.base_url().to_string();
        reqwest::Url::parse(&base_url).map_err(|_| KillchainError::InvalidUrl(base_url.clone()))?;
        Ok(Self {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            probe: Client::builder().timeout(PROBE_TIMEOUT).build()?,
            base_url,
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            retries: cfg.rest_retries,
            retry_delay: cfg.rest_retry_delay(),
            clock,
            cancel,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One attempt. `Ok(None)` means the server answered with an empty body.
    fn attempt(&self, payload: &Value, method: &Method) -> std::result::Result<Option<Value>, String> {
        let mut req = self
            .http
            .request(method.clone(), format!("{}{REST_PATH}", self.base_url))
            .json(payload);
        if let Some(key) = &self.api_key {
            req = req.header("KEY", key);
        }
        let resp = req.send().map_err(|e| e.to_string())?;
        let status = resp.status();
        let body = resp.bytes().map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| format!("invalid JSON body: {e}"))
    }
}

impl<K: Clock> ControlPlane for RestClient<K> {
    fn call(&self, payload: &Value, method: Method) -> Result<Value> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.retries {
            self.cancel.check()?;
            match self.attempt(payload, &method) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(attempt, "empty response body, control plane not ready");
                    last_error = "empty response body".to_string();
                }
                Err(e) => {
                    debug!(attempt, error = %e, "REST call failed");
                    last_error = e;
                }
            }
            if attempt < self.retries {
                self.clock.sleep(self.retry_delay, &self.cancel)?;
            }
        }
        warn!(attempts = self.retries, "REST error after retries: {last_error}");
        Err(KillchainError::RetriesExhausted {
            attempts: self.retries,
            last_error,
        })
    }
}

impl<K: Clock> Liveness for RestClient<K> {
    fn is_reachable(&self) -> bool {
        match self.probe.get(&self.base_url).send() {
            Ok(resp) => {
                let code = resp.status().as_u16();
                (200..500).contains(&code)
            }
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
