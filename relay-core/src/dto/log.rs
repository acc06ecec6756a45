//! Log DTOs

use serde::{Deserialize, Serialize};

/// Log output pushed by a job executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLog {
    pub content: String,
}
