//! Execution entity and its state machine
//!
//! One tool invocation. Lifecycle: `pending` → `running` → one of
//! {`completed`, `failed`, `cancelled`}. Terminal states are frozen: the
//! transition methods reject any change after a terminal status, so
//! `status`, `result`, `error`, and `completed_at` never mutate again.
//! `completed` sets `result`, `failed` sets `error`, `cancelled` sets
//! neither.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::rpc::protocol::ErrorObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub server_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
}

impl Execution {
    pub fn new(
        server_id: &str,
        method: &str,
        params: Option<serde_json::Value>,
        executed_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id: server_id.to_string(),
            method: method.to_string(),
            params,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            executed_by,
        }
    }

    fn guard_not_terminal(&self, transition: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CoreError::Internal(format!(
                "execution {} is terminal ({:?}), cannot {}",
                self.id, self.status, transition
            )));
        }
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.guard_not_terminal("run")?;
        if self.status != ExecutionStatus::Pending {
            return Err(CoreError::Internal(format!(
                "execution {} is {:?}, expected pending",
                self.id, self.status
            )));
        }
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value) -> Result<()> {
        self.guard_not_terminal("complete")?;
        self.status = ExecutionStatus::Completed;
        self.result = Some(result);
        self.seal();
        Ok(())
    }

    pub fn fail(&mut self, error: ErrorObject) -> Result<()> {
        self.guard_not_terminal("fail")?;
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.seal();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.guard_not_terminal("cancel")?;
        self.status = ExecutionStatus::Cancelled;
        self.seal();
        Ok(())
    }

    fn seal(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some(
            (now - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }
}

/// Filter for execution list queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_before: Option<DateTime<Utc>>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        if let Some(server_id) = &self.server_id {
            if &execution.server_id != server_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if execution.status != status {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if execution.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if execution.started_at > before {
                return false;
            }
        }
        true
    }
}
