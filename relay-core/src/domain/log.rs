//! Job log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A log record written by a job executor
///
/// `content` is `None` when the record was read without its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunLog {
    pub id: i64,
    pub job_run_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
