use uuid::Uuid;

/// Generates an opaque 32-character hex identifier, used for both job uuids and shot ids.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
