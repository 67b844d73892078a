use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Processing
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            // Unknown values are treated as failed so they can never be resumed
            _ => Self::Failed,
        }
    }
}

/// Stable handle to a persisted analysis result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub id: i64,
    pub access_token: String,
}

/// Durable state of one analysis task, as seen by polling callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub owner_id: i64,
    pub filename: String,
    pub source_file: Option<String>,
    pub status: TaskStatus,
    pub progress: i32,
    pub current_stage: String,
    pub stage_details: String,
    pub result: Option<ResultRef>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

impl TaskRecord {
    /// Message safe to show an end user. Internal failure detail stays in
    /// `error_message` and the logs.
    pub fn user_message(&self) -> &'static str {
        match self.status {
            TaskStatus::Processing => "Analysis in progress",
            TaskStatus::Completed => "Analysis complete",
            TaskStatus::Failed => "Processing failed, please retry",
            TaskStatus::Cancelled => "Analysis cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub access_token: String,
    pub owner_id: i64,
    pub task_id: i64,
    pub filename: String,
    pub file_type: String,
    pub artifact_json: String,
    pub metadata_json: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}
