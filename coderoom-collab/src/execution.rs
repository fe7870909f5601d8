//! Execution state broadcast.
//!
//! Whoever presses Run or Submit calls the execution backend locally and
//! writes progress and outcome into two shared maps, so every replica shows
//! the same run:
//!
//! - `executionState`: `isRunning`, `isSubmitting`, `showResults`, `selectedTestCase`
//! - `executionResults`: `runResult`, `submitResult`
//!
//! Writes are field-wise. Two clients running at once are not arbitrated;
//! their fields interleave by last-writer-wins.

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::doc::{DocError, Fields, LocalUpdate, SharedDoc, SharedMap};

pub const IS_RUNNING: &str = "isRunning";
pub const IS_SUBMITTING: &str = "isSubmitting";
pub const SHOW_RESULTS: &str = "showResults";
pub const SELECTED_TEST_CASE: &str = "selectedTestCase";
pub const RUN_RESULT: &str = "runResult";
pub const SUBMIT_RESULT: &str = "submitResult";

// ───────────────────────────────────────────────────────────────────
// Results
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Error,
    Timeout,
}

/// Outcome of running the code against one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(default)]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl RunResult {
    /// A failed call to the backend, broadcast like any other result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            actual_output: None,
            expected_output: None,
            error_message: Some(message.into()),
            error_type: None,
            traceback: None,
            execution_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    AllPassed,
    SomeFailed,
    AllFailed,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Outcome of running the code against the full test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub status: SubmitStatus,
    #[serde(default)]
    pub test_cases: Vec<TestCaseResult>,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub passed_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl SubmitResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Error,
            test_cases: Vec::new(),
            total_count: 0,
            passed_count: 0,
            failed_count: 0,
            error_message: Some(message.into()),
            execution_time_ms: 0,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

/// The `executionState` map with defaults for absent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub is_running: bool,
    pub is_submitting: bool,
    pub show_results: bool,
    pub selected_test_case: u32,
}

/// A partial write to `executionState`. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStatePatch {
    pub is_running: Option<bool>,
    pub is_submitting: Option<bool>,
    pub show_results: Option<bool>,
    pub selected_test_case: Option<u32>,
}

impl ExecutionStatePatch {
    pub fn running(running: bool) -> Self {
        Self {
            is_running: Some(running),
            ..Self::default()
        }
    }

    pub fn submitting(submitting: bool) -> Self {
        Self {
            is_submitting: Some(submitting),
            ..Self::default()
        }
    }

    pub fn selected_test_case(index: u32) -> Self {
        Self {
            selected_test_case: Some(index),
            ..Self::default()
        }
    }

    pub fn with_show_results(mut self, show: bool) -> Self {
        self.show_results = Some(show);
        self
    }

    fn into_fields(self) -> Vec<(String, Value)> {
        let mut fields = Vec::new();
        if let Some(v) = self.is_running {
            fields.push((IS_RUNNING.to_string(), json!(v)));
        }
        if let Some(v) = self.is_submitting {
            fields.push((IS_SUBMITTING.to_string(), json!(v)));
        }
        if let Some(v) = self.show_results {
            fields.push((SHOW_RESULTS.to_string(), json!(v)));
        }
        if let Some(v) = self.selected_test_case {
            fields.push((SELECTED_TEST_CASE.to_string(), json!(v)));
        }
        fields
    }
}

/// The `executionResults` map. Absent reads as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResults {
    pub run_result: Option<RunResult>,
    pub submit_result: Option<SubmitResult>,
}

/// A partial write to `executionResults`.
///
/// The outer `Option` says whether to write the field, the inner one
/// whether to write a result or `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResultsPatch {
    pub run_result: Option<Option<RunResult>>,
    pub submit_result: Option<Option<SubmitResult>>,
}

impl ExecutionResultsPatch {
    pub fn run(result: Option<RunResult>) -> Self {
        Self {
            run_result: Some(result),
            submit_result: None,
        }
    }

    pub fn submit(result: Option<SubmitResult>) -> Self {
        Self {
            run_result: None,
            submit_result: Some(result),
        }
    }

    fn into_fields(self) -> Result<Vec<(String, Value)>, DocError> {
        let mut fields = Vec::new();
        if let Some(result) = self.run_result {
            fields.push((RUN_RESULT.to_string(), serde_json::to_value(result)?));
        }
        if let Some(result) = self.submit_result {
            fields.push((SUBMIT_RESULT.to_string(), serde_json::to_value(result)?));
        }
        Ok(fields)
    }
}

fn read_or_default<T: DeserializeOwned + Default>(fields: &Fields, key: &str) -> T {
    match fields.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!("Ignoring malformed {key}: {e}");
            T::default()
        }),
    }
}

impl SharedDoc {
    pub fn execution_state(&self) -> ExecutionState {
        let fields = self.fields(SharedMap::ExecutionState);
        ExecutionState {
            is_running: read_or_default(fields, IS_RUNNING),
            is_submitting: read_or_default(fields, IS_SUBMITTING),
            show_results: read_or_default(fields, SHOW_RESULTS),
            selected_test_case: read_or_default(fields, SELECTED_TEST_CASE),
        }
    }

    pub fn execution_results(&self) -> ExecutionResults {
        let fields = self.fields(SharedMap::ExecutionResults);
        ExecutionResults {
            run_result: read_or_default(fields, RUN_RESULT),
            submit_result: read_or_default(fields, SUBMIT_RESULT),
        }
    }

    pub fn set_execution_state(&mut self, patch: ExecutionStatePatch) -> LocalUpdate {
        self.set_fields(SharedMap::ExecutionState, patch.into_fields())
    }

    pub fn set_execution_results(&mut self, patch: ExecutionResultsPatch) -> Result<LocalUpdate, DocError> {
        let fields = patch.into_fields()?;
        Ok(self.set_fields(SharedMap::ExecutionResults, fields))
    }
}
