//! Per-device persistence: one file per device under a configured folder,
//! line-based, holding a `device` header and zero or more `module` lines.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::ids::{DeviceId, ModuleId};
use crate::registry::{default_module_topic, AddOutcome, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    NotFound,
    Invalid,
}

/// Writes `<devices_folder>/<device_id>`: the device header followed by one
/// `module` line per module this device owns. A device with no counterpart
/// in `registry` is a no-op.
pub async fn save_device(
    registry: &Registry,
    devices_folder: &Path,
    device_id: &DeviceId,
) -> std::io::Result<()> {
    let device = match registry.get_device(device_id) {
        Some(device) => device,
        None => return Ok(()),
    };

    let mut contents = format!("device,{},{}\n", device.id, device.md_deps);
    for module in registry.enumerate_modules() {
        if &module.device == device_id {
            contents.push_str(&format!(
                "module,{},{},{}\n",
                module.id,
                module.topic,
                module.enabled as u8
            ));
        }
    }

    let path = devices_folder.join(device_id.as_str());
    let mut file = File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    Ok(())
}

/// Loads `<devices_folder>/<device_id>` into `registry`, creating the device
/// and its modules. Any parse error aborts the load and leaves `registry`
/// with whatever partial state was inserted before the error — the caller
/// owns deciding whether to roll that back, matching the original's
/// "aborts on parse error" behaviour rather than silently ignoring it.
pub async fn load_device(
    registry: &mut Registry,
    devices_folder: &Path,
    device_id: &DeviceId,
) -> LoadOutcome {
    let path = devices_folder.join(device_id.as_str());
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(_) => return LoadOutcome::NotFound,
    };
    let mut lines = BufReader::new(file).lines();
    let mut header_seen = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => return LoadOutcome::Invalid,
        };
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(4, ',');
        match fields.next() {
            Some("device") if !header_seen => {
                let (Some(id_str), Some(md_deps_str)) = (fields.next(), fields.next()) else {
                    return LoadOutcome::Invalid;
                };
                if id_str != device_id.as_str() {
                    return LoadOutcome::Invalid;
                }
                let (Some(id), Some(md_deps)) =
                    (DeviceId::parse(id_str), ModuleId::parse(md_deps_str))
                else {
                    return LoadOutcome::Invalid;
                };
                if registry.add_device(id, md_deps) != AddOutcome::Ok {
                    return LoadOutcome::Invalid;
                }
                header_seen = true;
            }
            Some("device") => return LoadOutcome::Invalid, // header must appear exactly once
            Some("module") if header_seen => {
                let (Some(md_id_str), Some(topic), Some(enabled_str)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return LoadOutcome::Invalid;
                };
                let Some(module_id) = ModuleId::parse(md_id_str) else {
                    return LoadOutcome::Invalid;
                };
                if registry.add_module(module_id.clone(), device_id.clone()) != AddOutcome::Ok {
                    return LoadOutcome::Invalid;
                }
                if topic != default_module_topic(&registry.bridge.id, &module_id) {
                    registry.set_module_topic(&module_id, topic);
                }
                registry.set_module_enabled(&module_id, enabled_str != "0");
            }
            _ => return LoadOutcome::Invalid,
        }
    }

    if header_seen {
        LoadOutcome::Loaded
    } else {
        LoadOutcome::Invalid
    }
}
