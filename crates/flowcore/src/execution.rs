use crate::{StepId, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Category of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Graph,
    Configuration,
    Template,
    Executor,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionErrorEntry {
    /// Absent for errors raised before any step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Complete outcome of one workflow invocation.
///
/// Owned by the engine while the run is in flight, then handed to the
/// execution store as a read-only record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub step_results: BTreeMap<StepId, Value>,
    pub step_statuses: BTreeMap<StepId, StepStatus>,
    #[serde(default)]
    pub step_durations_ms: BTreeMap<StepId, u64>,
    pub errors: Vec<ExecutionErrorEntry>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            step_results: BTreeMap::new(),
            step_statuses: BTreeMap::new(),
            step_durations_ms: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Move from `pending` to `running`. No-op in any other state.
    pub fn start(&mut self) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Running;
        }
    }

    /// Set the terminal status and end time. Ignored once terminal.
    pub fn finish(&mut self, status: ExecutionStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_statuses.get(step_id).copied()
    }

    pub fn set_step_status(&mut self, step_id: impl Into<StepId>, status: StepStatus) {
        self.step_statuses.insert(step_id.into(), status);
    }

    pub fn record_success(&mut self, step_id: &str, output: Value, duration_ms: u64) {
        self.step_results.insert(step_id.to_string(), output);
        self.step_durations_ms.insert(step_id.to_string(), duration_ms);
        self.set_step_status(step_id, StepStatus::Completed);
    }

    pub fn record_failure(
        &mut self,
        step_id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        duration_ms: Option<u64>,
    ) {
        if let Some(ms) = duration_ms {
            self.step_durations_ms.insert(step_id.to_string(), ms);
        }
        self.set_step_status(step_id, StepStatus::Failed);
        self.errors.push(ExecutionErrorEntry {
            step_id: Some(step_id.to_string()),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    /// Record an error that is not attributable to one step.
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(ExecutionErrorEntry {
            step_id: None,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.step_statuses.values().filter(|s| **s == status).count()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_one_way() {
        let mut exec = WorkflowExecution::new("wf");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        exec.start();
        assert_eq!(exec.status, ExecutionStatus::Running);
        exec.finish(ExecutionStatus::Completed);
        exec.finish(ExecutionStatus::Failed);
        exec.start();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.end_time.is_some());
    }

    #[test]
    fn failures_are_recorded_in_order() {
        let mut exec = WorkflowExecution::new("wf");
        exec.record_failure("a", ErrorKind::Executor, "boom", Some(3));
        exec.record_error(ErrorKind::Timeout, "deadline");
        assert_eq!(exec.step_status("a"), Some(StepStatus::Failed));
        assert_eq!(exec.errors.len(), 2);
        assert_eq!(exec.errors[0].step_id.as_deref(), Some("a"));
        assert!(exec.errors[1].step_id.is_none());
        assert!(!exec.step_results.contains_key("a"));
    }

    #[test]
    fn serializes_status_names() {
        let mut exec = WorkflowExecution::new("wf");
        exec.set_step_status("s", StepStatus::Skipped);
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["step_statuses"]["s"], "skipped");
        assert!(json["end_time"].is_null());
    }
}
