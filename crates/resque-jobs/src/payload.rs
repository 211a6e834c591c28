//! Job payload wire format.
//!
//! A payload is the JSON document pushed onto a queue list:
//!
//! ```json
//! {"class":"Send_Email","args":[{"to":"a@b.c"}],"id":"5f0c…","queue":"mail","queue_time":1712.5,"prefix":""}
//! ```
//!
//! `args` is written as a one-element array wrapping the argument mapping.
//! Older producers stored the bare mapping, and some omit it or store `null`;
//! all of these are read back as a single mapping.

use crate::error::{JobError, JobResult};
use chrono::Utc;
use resque_core::JobId;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Argument mapping handed to a job.
pub type JobArgs = Map<String, Value>;

/// Serialized description of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Job class identifier resolved by the factory.
    pub class: String,

    /// Argument mapping.
    #[serde(default, serialize_with = "serialize_args", deserialize_with = "deserialize_args")]
    pub args: JobArgs,

    /// Unique job id.
    #[serde(default)]
    pub id: JobId,

    /// Queue the payload was pushed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Enqueue time in fractional unix seconds.
    #[serde(default)]
    pub queue_time: f64,

    /// Status namespace of the job.
    #[serde(default)]
    pub prefix: String,

    /// Whether a status record was created for this job.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub monitor: bool,
}

impl Payload {
    /// Builds a payload stamped with the current time.
    pub fn new(queue: impl Into<String>, class: impl Into<String>, args: JobArgs, id: JobId) -> Self {
        Self {
            class: class.into(),
            args,
            id,
            queue: Some(queue.into()),
            queue_time: now_seconds(),
            prefix: String::new(),
            monitor: false,
        }
    }

    /// Sets the status namespace.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Marks the payload as status-tracked.
    #[must_use]
    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    /// Encodes the payload to its wire form.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a payload from its wire form, normalizing `args`.
    pub fn from_json(raw: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Returns true when class, queue and arguments all match. A payload
    /// without a queue matches nothing.
    ///
    /// Mapping equality ignores key order.
    pub fn matches(&self, queue: &str, class: &str, args: &JobArgs) -> bool {
        self.class == class && self.queue.as_deref() == Some(queue) && &self.args == args
    }
}

/// Validates enqueue-time arguments and turns them into a mapping.
///
/// `null` and an empty array stand for "no arguments". Anything else that is
/// not an object is rejected.
pub fn normalize_args(args: Value) -> JobResult<JobArgs> {
    match args {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        Value::Array(items) if items.is_empty() => Ok(Map::new()),
        other => Err(JobError::ArgumentType(format!("expected an object, got {}", type_name(&other)))),
    }
}

/// Current time in fractional unix seconds.
#[allow(clippy::cast_precision_loss)] // unix seconds stay far below 2^52
pub(crate) fn now_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn serialize_args<S: Serializer>(args: &JobArgs, serializer: S) -> Result<S::Ok, S::Error> {
    [args].serialize(serializer)
}

fn deserialize_args<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JobArgs, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::Array(items) => match <[Value; 1]>::try_from(items) {
            Ok([Value::Object(map)]) => Ok(map),
            Ok([Value::Null]) => Ok(Map::new()),
            Ok([other]) => Err(D::Error::custom(format!(
                "args must wrap a mapping, found {}",
                type_name(&other)
            ))),
            Err(items) if items.is_empty() => Ok(Map::new()),
            Err(items) => Err(D::Error::custom(format!(
                "args must hold exactly one mapping, found {} elements",
                items.len()
            ))),
        },
        other => Err(D::Error::custom(format!("args must be a mapping, found {}", type_name(&other)))),
    }
}
