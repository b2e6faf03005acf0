//! Durable known-device store (spec.md §4.K).
//!
//! A flat JSON array at a single path, upserted by `device_id`. Grounded on
//! the whole-file-pretty-JSON registry pattern in the teacher's
//! `DeviceManager::save_registry`/`load_registry`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownDevice {
    pub device_id: String,
    pub device_name: String,
    pub address: String,
    pub port: u16,
}

/// Load known devices from `path`. Returns an empty list if the file is
/// missing or isn't a JSON array — never an error, per spec.md §4.K.
pub fn load(path: &Path) -> Vec<KnownDevice> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&contents).unwrap_or_default()
}

fn write_all(devices: &[KnownDevice], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(devices)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Upsert `device` by `device_id` and rewrite the whole file.
pub fn save(device: KnownDevice, path: &Path) -> Result<()> {
    let mut devices = load(path);
    match devices
        .iter_mut()
        .find(|d| d.device_id == device.device_id)
    {
        Some(existing) => *existing = device,
        None => devices.push(device),
    }
    write_all(&devices, path)
}

/// Remove `device_id`; a no-op if it isn't present. If the store file
/// doesn't exist yet, this never creates it.
pub fn remove(device_id: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut devices = load(path);
    devices.retain(|d| d.device_id != device_id);
    write_all(&devices, path)
}
