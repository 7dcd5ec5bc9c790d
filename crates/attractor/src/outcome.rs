use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Context updates carried by an outcome, merged atomically after each step.
pub type ContextValues = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Fail,
    PartialSuccess,
    Retry,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            "partial_success" => Some(Self::PartialSuccess),
            "retry" => Some(Self::Retry),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Success and partial success both satisfy a goal gate.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

/// Structured result of a handler invocation: status, routing hints,
/// context updates, and free-text notes.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: ContextValues,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self::success()
    }
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: ContextValues::new(),
            notes: None,
            failure_reason: None,
        }
    }

    pub fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            ..Self::success()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            failure_reason: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Retry,
            failure_reason: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.status == StageStatus::Fail
    }
}
