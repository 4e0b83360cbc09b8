use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per succeeded job, keyed by `job_id`. Written with an upsert so
/// queue re-deliveries never double-count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    pub job_id: String,
    pub user_id: String,
    pub pixels_processed: i64,
    pub bytes_saved: i64,
    pub compute_time_ms: i64,
    pub created_at: DateTime<Utc>,
}
