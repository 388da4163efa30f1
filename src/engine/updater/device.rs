//! Stable device identifier, generated once and persisted

use crate::engine::updater::state::{LocalRecords, StateError};

const KEY_DEVICE_ID: &str = "device_id";

pub fn device_id(records: &LocalRecords) -> Result<String, StateError> {
    if let Some(existing) = records.read::<String>(KEY_DEVICE_ID)? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let created = uuid::Uuid::new_v4().to_string();
    records.write(KEY_DEVICE_ID, &created)?;
    tracing::info!(device_id = %created, "Generated device id");
    Ok(created)
}
