use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Available,
    Unavailable,
    NotFound,
    Error,
    Operational,
    Failed,
    MeetsTarget,
    ExceedsTarget,
}

impl CheckStatus {
    /// Only these two count against the overall verdict.
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Failed | CheckStatus::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Passed,
    Partial,
    Failed,
}

impl OverallStatus {
    pub fn from_failures(failed_checks: usize) -> Self {
        match failed_checks {
            0 => OverallStatus::Passed,
            1 => OverallStatus::Partial,
            _ => OverallStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Passed => "PASSED",
            OverallStatus::Partial => "PARTIAL",
            OverallStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            time_ms: None,
            details: Value::Null,
            error: None,
        }
    }

    pub fn with_time(mut self, ms: u64) -> Self {
        self.time_ms = Some(ms);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverReport {
    pub timestamp: String,
    pub tests: Vec<CheckResult>,
    pub overall_status: OverallStatus,
}

impl FailoverReport {
    pub fn from_checks(timestamp: String, tests: Vec<CheckResult>) -> Self {
        let failed = tests.iter().filter(|t| t.status.is_failure()).count();
        Self {
            timestamp,
            tests,
            overall_status: OverallStatus::from_failures(failed),
        }
    }
}
