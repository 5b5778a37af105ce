/// Block device discovery for per-device I/O limits
use crate::types::{Result, TelePilotError};
use std::fs;
use std::path::Path;

/// Enumerate the host's non-loop block devices as "major:minor" strings.
///
/// The result feeds the per-device entries written into a job cgroup's
/// io.max file. Fails if no device is found, as a job would otherwise run
/// without any I/O limit.
pub fn discover() -> Result<Vec<String>> {
    scan(Path::new("/sys/block"))
}

fn scan(base: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(base)
        .map_err(|e| TelePilotError::BlockDevice(format!("read {}: {}", base.display(), e)))?;

    let mut devices = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| TelePilotError::BlockDevice(format!("read dir entry: {}", e)))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // Loop devices are not real disks, skip them.
        if name.starts_with("loop") {
            continue;
        }

        let dev_file = entry.path().join("dev");
        let id = fs::read_to_string(&dev_file).map_err(|e| {
            TelePilotError::BlockDevice(format!("read {}: {}", dev_file.display(), e))
        })?;
        devices.push(id.trim().to_string());
    }

    if devices.is_empty() {
        return Err(TelePilotError::BlockDevice(format!(
            "no block devices found under {}",
            base.display()
        )));
    }

    log::debug!("Block devices found: {:?}", devices);
    Ok(devices)
}
