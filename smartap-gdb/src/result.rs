use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A scalar extracted from a transcript or passed into a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// One `[i/n] description` progress line reported by a script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub name: String,
    pub status: StepStatus,
    pub message: String,
}

/// The outcome of one debugger script.
///
/// `success` and `error` are kept consistent: a successful result never
/// carries an error message, and [`ScriptResult::fail`] always clears success.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    success: bool,
    pub steps: Vec<Step>,
    pub data: BTreeMap<String, Value>,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub duration: Duration,
    pub raw_stdout: String,
    pub raw_stderr: String,
    error: Option<String>,
}

impl ScriptResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn succeed(&mut self) {
        self.success = true;
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }

    pub fn add_step(&mut self, index: u32, name: impl Into<String>, status: StepStatus, message: impl Into<String>) {
        self.steps.push(Step {
            index,
            name: name.into(),
            status,
            message: message.into(),
        });
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn success_steps(&self) -> usize {
        self.count_steps(StepStatus::Success)
    }

    pub fn failed_steps(&self) -> usize {
        self.count_steps(StepStatus::Failed)
    }

    fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
