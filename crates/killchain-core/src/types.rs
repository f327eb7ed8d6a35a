use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// AdversaryJob
// ---------------------------------------------------------------------------

/// One entry of the configured kill-chain list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdversaryJob {
    pub name: String,
    pub group: String,
    pub enabled: bool,
    /// 1-based position in the configured list (the `N` of `ENABLEKC<N>`).
    pub position: usize,
}

impl AdversaryJob {
    pub fn new(name: impl Into<String>, group: impl Into<String>, position: usize) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            enabled: true,
            position,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationState
// ---------------------------------------------------------------------------

/// Remote state strings that count as a finished operation.
pub const TERMINAL_STATES: &[&str] = &["finished", "complete", "completed", "success", "stopped"];

/// Local view of an operation's lifecycle.
///
/// Transitions: `Created → Running → Finished | Timeout | NotFound`.
/// `Timeout` is never reported by the control plane; it is reached when the
/// local deadline elapses first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    Created,
    Running,
    Finished,
    Timeout,
    NotFound,
    /// Any other remote vocabulary (`paused`, `cleanup`, ...). Non-terminal.
    Other(String),
}

impl OperationState {
    /// Derive the local state from the remote `state` field and completion flag.
    pub fn from_remote(state: &str, complete: bool) -> Self {
        let state = state.trim().to_ascii_lowercase();
        if complete || TERMINAL_STATES.contains(&state.as_str()) {
            return OperationState::Finished;
        }
        match state.as_str() {
            "" => OperationState::Created,
            "running" | "started" => OperationState::Running,
            _ => OperationState::Other(state),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Finished | OperationState::Timeout | OperationState::NotFound
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationState::Created => "created",
            OperationState::Running => "running",
            OperationState::Finished => "finished",
            OperationState::Timeout => "timeout",
            OperationState::NotFound => "not-found",
            OperationState::Other(s) => s,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RemoteOperation
// ---------------------------------------------------------------------------

/// An operation as last read from the control plane. Never edited locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteOperation {
    pub id: String,
    pub name: String,
    pub adversary_id: String,
    pub group: String,
    pub planner: String,
    pub autonomous: bool,
    pub auto_close: bool,
    pub state: OperationState,
    /// The `state` field exactly as reported, lowercased.
    pub raw_state: String,
    pub complete: bool,
    /// Start time in epoch seconds; `0.0` when absent or unparseable.
    pub started_at: f64,
}

/// Wire shape of an operation. Every field is optional and loosely typed;
/// normalization happens in [`RemoteOperation::from_value`].
#[derive(Debug, Default, Deserialize)]
struct RawOperation {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    op_id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    adversary_id: Option<Value>,
    #[serde(default)]
    adversary: Option<Value>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    planner: Option<Value>,
    #[serde(default)]
    autonomous: Option<Value>,
    #[serde(default)]
    auto_close: Option<Value>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    complete: Option<Value>,
    #[serde(default)]
    completed: Option<Value>,
    #[serde(default)]
    finished: Option<Value>,
    #[serde(default)]
    start: Option<Value>,
    #[serde(default)]
    start_time: Option<Value>,
}

impl RemoteOperation {
    /// Decode one operation object. Returns `None` for non-objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let raw: RawOperation = serde_json::from_value(value.clone()).ok()?;

        let adversary_id = raw
            .adversary_id
            .as_ref()
            .and_then(id_string)
            .or_else(|| {
                raw.adversary
                    .as_ref()
                    .and_then(|a| a.get("adversary_id"))
                    .and_then(id_string)
            })
            .unwrap_or_default();
        let planner = match raw.planner.as_ref() {
            Some(Value::Object(p)) => p
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some(other) => id_string(other).unwrap_or_default(),
            None => String::new(),
        };
        let complete = [&raw.complete, &raw.completed, &raw.finished]
            .into_iter()
            .any(|flag| flag.as_ref().is_some_and(truthy));
        let raw_state = raw.state.unwrap_or_default().trim().to_ascii_lowercase();
        let started_at = raw
            .start
            .as_ref()
            .filter(|v| truthy(v))
            .or(raw.start_time.as_ref())
            .map(epoch_seconds)
            .unwrap_or(0.0);

        Some(Self {
            id: raw
                .id
                .as_ref()
                .or(raw.op_id.as_ref())
                .and_then(id_string)
                .unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            adversary_id,
            group: raw.group.unwrap_or_default(),
            planner,
            autonomous: raw.autonomous.as_ref().is_some_and(truthy),
            auto_close: raw.auto_close.as_ref().is_some_and(truthy),
            state: OperationState::from_remote(&raw_state, complete),
            raw_state,
            complete,
            started_at,
        })
    }

    /// Decode every object in a list response, skipping anything malformed.
    pub fn list_from(values: &[Value]) -> Vec<Self> {
        values.iter().filter_map(Self::from_value).collect()
    }
}

// ---------------------------------------------------------------------------
// OperationRef
// ---------------------------------------------------------------------------

/// Normalized handle to a created operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub id: String,
}

/// The shapes a creation response has been observed in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateResponse {
    One(serde_json::Map<String, Value>),
    Many(Vec<Value>),
    Other(serde::de::IgnoredAny),
}

impl OperationRef {
    /// Extract the operation id from a creation response.
    ///
    /// Accepts an object or a list whose first element is an object, reading
    /// `id` then `op_id`; integer and string ids are both normalized to a
    /// string. Anything else yields `None`.
    pub fn from_response(response: &Value) -> Option<Self> {
        let object = match serde_json::from_value::<CreateResponse>(response.clone()).ok()? {
            CreateResponse::One(map) => map,
            CreateResponse::Many(list) => match list.into_iter().next()? {
                Value::Object(map) => map,
                _ => return None,
            },
            CreateResponse::Other(_) => return None,
        };
        ["id", "op_id"]
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(id_string)
            .map(|id| OperationRef { id })
    }
}

// ---------------------------------------------------------------------------
// SequenceOutcome / SequenceReport
// ---------------------------------------------------------------------------

/// Result of one executed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutcome {
    pub adversary_name: String,
    pub group: String,
    pub ok: bool,
    pub final_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub reused: bool,
    /// Last state seen from the control plane when the run timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<String>,
}

impl SequenceOutcome {
    pub fn not_found(job: &AdversaryJob) -> Self {
        Self {
            adversary_name: job.name.clone(),
            group: job.group.clone(),
            ok: false,
            final_state: OperationState::NotFound.to_string(),
            operation_id: None,
            reused: false,
            last_observed: None,
        }
    }

    pub fn summary_line(&self) -> String {
        let verdict = if self.ok { "OK" } else { "FAIL" };
        let mut line = format!(
            "- {} [group={}]: {} (state={})",
            self.adversary_name, self.group, verdict, self.final_state
        );
        if let Some(last) = &self.last_observed {
            line.push_str(&format!(" last={last}"));
        }
        line
    }
}

/// Aggregate result of a sequencer run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceReport {
    /// Number of enabled jobs handed to the sequencer.
    pub planned: usize,
    pub outcomes: Vec<SequenceOutcome>,
}

impl SequenceReport {
    /// `true` when there was nothing to do, or every executed job succeeded
    /// and at least one ran.
    pub fn success(&self) -> bool {
        if self.planned == 0 {
            return true;
        }
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.ok)
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Normalize an id that may be a string or a number. Empty strings and
/// `null` are treated as absent.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Loose truthiness of a JSON value: `false`, `0`, `""`, `null`, and empty
/// containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Interpret a start timestamp as epoch seconds.
///
/// Accepts numbers, numeric strings, RFC 3339, and `YYYY-MM-DD HH:MM:SS`
/// (UTC). Anything else maps to `0.0`.
pub fn epoch_seconds(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_timestamp(s.trim()).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_timestamp(s: &str) -> Option<f64> {
    if let Ok(f) = s.parse::<f64>() {
        return Some(f);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(to_epoch(dt.with_timezone(&Utc)));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| to_epoch(naive.and_utc()))
}

pub(crate) fn to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_millis()) / 1000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
