//! Run records and the request/response payloads of the run API.
//!
//! Request payloads are validated here, before any business logic runs.
//! Validation failures carry the offending field name so the HTTP layer can
//! report it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::UserId;
use crate::verifier::RunError;

/// Run identifier (UUID string).
pub type RunId = String;

/// Key of the bomb counter embedded in a run's state blob.
pub const BOMBS_USED_KEY: &str = "bombsUsed";

/// Maximum seed length in characters.
pub const MAX_SEED_LEN: usize = 128;

/// Maximum number of perks or mutations per checkpoint.
pub const MAX_IDENTIFIERS: usize = 64;

/// Maximum length of one perk or mutation identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Lifecycle of a run. Only `InProgress` runs can be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Finished,
    Abandoned,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// A persisted progression run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub user_id: UserId,
    pub seed: String,
    /// Serialized as a decimal string so values above 2^53 survive JSON
    /// consumers that parse numbers as doubles.
    #[serde(with = "score_string")]
    pub score: u64,
    pub lines: u64,
    pub level: u64,
    #[serde(default)]
    pub perks: Vec<String>,
    #[serde(default)]
    pub mutations: Vec<String>,
    #[serde(default)]
    pub bombs: u64,
    #[serde(default)]
    pub time_freeze_charges: u64,
    #[serde(default)]
    pub chaos_mode: bool,
    #[serde(default = "unit_multiplier")]
    pub gravity_multiplier: f64,
    #[serde(default = "unit_multiplier")]
    pub score_multiplier: f64,
    /// Client-owned state blob. Always a JSON object carrying `bombsUsed`.
    pub state: Value,
    pub status: RunStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

impl Run {
    /// A fresh `IN_PROGRESS` run with zero score and lines.
    ///
    /// A non-object `state` is replaced by an empty object; any
    /// client-supplied `bombsUsed` is overwritten with zero.
    pub fn start(user_id: UserId, seed: String, state: Option<Value>) -> Self {
        let mut state = match state {
            Some(Value::Object(map)) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        if let Value::Object(map) = &mut state {
            map.insert(BOMBS_USED_KEY.to_string(), Value::from(0u64));
        }
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            seed,
            score: 0,
            lines: 0,
            level: 1,
            perks: Vec::new(),
            mutations: Vec::new(),
            bombs: 0,
            time_freeze_charges: 0,
            chaos_mode: false,
            gravity_multiplier: 1.0,
            score_multiplier: 1.0,
            state,
            status: RunStatus::InProgress,
            created_at_ms: now_ms(),
            ended_at_ms: None,
        }
    }

    /// The bomb counter tracked inside the state blob (0 if absent).
    pub fn bombs_used(&self) -> u64 {
        self.state
            .get(BOMBS_USED_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Raise the bomb counter to `reported` if it is higher. Never lowers it.
    pub fn track_bombs_used(&mut self, reported: u64) {
        let tracked = self.bombs_used().max(reported);
        if !self.state.is_object() {
            self.state = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.state {
            map.insert(BOMBS_USED_KEY.to_string(), Value::from(tracked));
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == RunStatus::InProgress
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn unit_multiplier() -> f64 {
    1.0
}

mod score_string {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(score: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(score)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

fn validation(field: &str, message: impl Into<String>) -> RunError {
    RunError::Validation {
        field: Some(field.to_string()),
        message: message.into(),
    }
}

/// Body of `POST /run/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub seed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl StartRunRequest {
    /// # Errors
    ///
    /// [`RunError::Validation`] for an empty or over-long seed, or a state
    /// that is neither an object nor null.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.seed.is_empty() {
            return Err(validation("seed", "must not be empty"));
        }
        if self.seed.chars().count() > MAX_SEED_LEN {
            return Err(validation(
                "seed",
                format!("must be at most {MAX_SEED_LEN} characters"),
            ));
        }
        match &self.state {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(validation("state", "must be an object")),
        }
    }
}

/// Body of `POST /run/:id/checkpoint`.
///
/// Integer fields are signed on the wire so negative values can be rejected
/// with a field-level error instead of a generic parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    pub lines: i64,
    #[serde(default)]
    pub perks: Vec<String>,
    #[serde(default)]
    pub mutations: Vec<String>,
    #[serde(default)]
    pub bombs: i64,
    #[serde(default)]
    pub bombs_used: i64,
    #[serde(default)]
    pub time_freeze_charges: i64,
    #[serde(default)]
    pub chaos_mode: bool,
    #[serde(default = "unit_multiplier")]
    pub gravity_multiplier: f64,
    #[serde(default = "unit_multiplier")]
    pub score_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_token: Option<String>,
}

/// A checkpoint that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub lines: u64,
    pub perks: Vec<String>,
    pub mutations: Vec<String>,
    pub bombs: u64,
    pub bombs_used: u64,
    pub time_freeze_charges: u64,
    pub chaos_mode: bool,
    pub gravity_multiplier: f64,
    pub score_multiplier: f64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            lines: 0,
            perks: Vec::new(),
            mutations: Vec::new(),
            bombs: 0,
            bombs_used: 0,
            time_freeze_charges: 0,
            chaos_mode: false,
            gravity_multiplier: 1.0,
            score_multiplier: 1.0,
        }
    }
}

impl Checkpoint {
    /// A checkpoint reporting `lines` with every other field at its default.
    pub fn lines(lines: u64) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64, RunError> {
    u64::try_from(value).map_err(|_| validation(field, "must be a non-negative integer"))
}

fn multiplier(field: &str, value: f64) -> Result<f64, RunError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(validation(field, "must be a finite, non-negative number"))
    }
}

fn identifiers(field: &str, values: Vec<String>) -> Result<Vec<String>, RunError> {
    if values.len() > MAX_IDENTIFIERS {
        return Err(validation(
            field,
            format!("at most {MAX_IDENTIFIERS} entries allowed"),
        ));
    }
    if values
        .iter()
        .any(|v| v.is_empty() || v.chars().count() > MAX_IDENTIFIER_LEN)
    {
        return Err(validation(
            field,
            format!("entries must be 1 to {MAX_IDENTIFIER_LEN} characters"),
        ));
    }
    let mut unique = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    Ok(unique)
}

impl CheckpointRequest {
    /// Validate and convert into a [`Checkpoint`]. Duplicate perks and
    /// mutations collapse to one entry.
    ///
    /// # Errors
    ///
    /// [`RunError::Validation`] naming the first offending field.
    pub fn validate(self) -> Result<Checkpoint, RunError> {
        Ok(Checkpoint {
            lines: non_negative("lines", self.lines)?,
            perks: identifiers("perks", self.perks)?,
            mutations: identifiers("mutations", self.mutations)?,
            bombs: non_negative("bombs", self.bombs)?,
            bombs_used: non_negative("bombsUsed", self.bombs_used)?,
            time_freeze_charges: non_negative("timeFreezeCharges", self.time_freeze_charges)?,
            chaos_mode: self.chaos_mode,
            gravity_multiplier: multiplier("gravityMultiplier", self.gravity_multiplier)?,
            score_multiplier: multiplier("scoreMultiplier", self.score_multiplier)?,
        })
    }
}

/// Body of `POST /run/:id/end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRunRequest {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_token: Option<String>,
}

impl EndRunRequest {
    /// The requested terminal status.
    ///
    /// # Errors
    ///
    /// [`RunError::Validation`] unless the status is `FINISHED` or `ABANDONED`.
    pub fn validate(&self) -> Result<RunStatus, RunError> {
        match self.status.as_str() {
            "FINISHED" => Ok(RunStatus::Finished),
            "ABANDONED" => Ok(RunStatus::Abandoned),
            _ => Err(validation("status", "must be FINISHED or ABANDONED")),
        }
    }
}

/// Response of `POST /run/start`: the run plus its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedRun {
    #[serde(flatten)]
    pub run: Run,
    pub run_token: String,
}

/// Response of `POST /run/:id/checkpoint`. All values are server-computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub success: bool,
    /// Decimal string, exact for every storable score.
    pub score: String,
    pub lines: u64,
    pub level: u64,
}

/// Response of `POST /run/:id/end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndOutcome {
    pub success: bool,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_of(err: RunError) -> Option<String> {
        match err {
            RunError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn start_embeds_zero_bombs_used() {
        let run = Run::start(1, "S1".into(), Some(json!({"bombsUsed": 9, "hold": "T"})));
        assert_eq!(run.bombs_used(), 0);
        assert_eq!(run.state["hold"], "T");
        assert_eq!(run.level, 1);
        assert_eq!(run.status, RunStatus::InProgress);
    }

    #[test]
    fn start_without_state_gets_an_object() {
        let run = Run::start(1, "S1".into(), None);
        assert_eq!(run.state, json!({"bombsUsed": 0}));
    }

    #[test]
    fn bombs_used_never_decreases() {
        let mut run = Run::start(1, "S1".into(), None);
        run.track_bombs_used(3);
        run.track_bombs_used(1);
        assert_eq!(run.bombs_used(), 3);
    }

    #[test]
    fn run_wire_shape() {
        let mut run = Run::start(42, "S1".into(), None);
        run.score = u64::try_from(i64::MAX).unwrap();
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["userId"], 42);
        assert_eq!(v["score"], "9223372036854775807");
        assert_eq!(v["status"], "IN_PROGRESS");
        assert!(v.get("endedAtMs").is_none());

        let back: Run = serde_json::from_value(v).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn numeric_score_is_accepted_on_read() {
        let mut v = serde_json::to_value(Run::start(1, "S1".into(), None)).unwrap();
        v["score"] = json!(1500);
        let run: Run = serde_json::from_value(v).unwrap();
        assert_eq!(run.score, 1500);
    }

    #[test]
    fn start_request_validation() {
        let ok = StartRunRequest {
            seed: "S1".into(),
            state: None,
        };
        assert!(ok.validate().is_ok());

        let empty = StartRunRequest {
            seed: String::new(),
            state: None,
        };
        assert_eq!(field_of(empty.validate().unwrap_err()).as_deref(), Some("seed"));

        let long = StartRunRequest {
            seed: "x".repeat(MAX_SEED_LEN + 1),
            state: None,
        };
        assert_eq!(field_of(long.validate().unwrap_err()).as_deref(), Some("seed"));

        let scalar_state = StartRunRequest {
            seed: "S1".into(),
            state: Some(json!(5)),
        };
        assert_eq!(
            field_of(scalar_state.validate().unwrap_err()).as_deref(),
            Some("state")
        );
    }

    #[test]
    fn checkpoint_defaults_and_camel_case() {
        let req: CheckpointRequest = serde_json::from_value(json!({
            "lines": 12,
            "bombsUsed": 2,
            "timeFreezeCharges": 1,
            "runToken": "abc"
        }))
        .unwrap();
        assert_eq!(req.run_token.as_deref(), Some("abc"));
        let cp = req.validate().unwrap();
        assert_eq!(cp.lines, 12);
        assert_eq!(cp.bombs_used, 2);
        assert_eq!(cp.time_freeze_charges, 1);
        assert!((cp.score_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn checkpoint_rejects_bad_fields() {
        let base = json!({"lines": 1});
        let cases = [
            ("lines", json!(-1)),
            ("bombs", json!(-2)),
            ("bombsUsed", json!(-3)),
            ("timeFreezeCharges", json!(-4)),
            ("scoreMultiplier", json!(-0.5)),
            ("gravityMultiplier", json!(-1.0)),
        ];
        for (field, value) in cases {
            let mut body = base.clone();
            body[field] = value;
            let req: CheckpointRequest = serde_json::from_value(body).unwrap();
            assert_eq!(
                field_of(req.validate().unwrap_err()).as_deref(),
                Some(field),
                "field {field}"
            );
        }
    }

    #[test]
    fn identifier_lists_are_bounded_and_deduplicated() {
        let mut req: CheckpointRequest = serde_json::from_value(json!({"lines": 0})).unwrap();
        req.perks = vec!["a".into(); MAX_IDENTIFIERS + 1];
        assert_eq!(field_of(req.clone().validate().unwrap_err()).as_deref(), Some("perks"));

        req.perks = vec!["x".repeat(MAX_IDENTIFIER_LEN + 1)];
        assert_eq!(field_of(req.clone().validate().unwrap_err()).as_deref(), Some("perks"));

        req.perks = vec!["a".into(), "b".into(), "a".into()];
        assert_eq!(req.validate().unwrap().perks, vec!["a", "b"]);
    }

    #[test]
    fn end_status_must_be_terminal() {
        let end = |s: &str| EndRunRequest {
            status: s.into(),
            run_token: None,
        };
        assert_eq!(end("FINISHED").validate().unwrap(), RunStatus::Finished);
        assert_eq!(end("ABANDONED").validate().unwrap(), RunStatus::Abandoned);
        assert!(end("IN_PROGRESS").validate().is_err());
        assert!(end("finished").validate().is_err());
    }

    #[test]
    fn started_run_flattens() {
        let started = StartedRun {
            run: Run::start(1, "S1".into(), None),
            run_token: "t".into(),
        };
        let v = serde_json::to_value(&started).unwrap();
        assert_eq!(v["runToken"], "t");
        assert_eq!(v["seed"], "S1");
    }
}
