use uuid::Uuid;

/// Allocate an opaque 128-bit job identifier, rendered as 32 lowercase hex
/// characters.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}
