/// Generates an opaque session id, easy to recognize in logs.
pub fn new_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4().simple())
}
