//! The in-memory device/module registry: the bridge's own runtime state plus
//! the keyed collections of devices and modules it has observed.
//!
//! The original implementation kept modules in a singly-linked list and
//! devices in a realloc'd array; both are replaced here by
//! [`indexmap::IndexMap`]s keyed by id, which keep insertion order (so
//! enumeration order matches the original's append order) without the
//! orphan-pointer hazard a manual linked list invites.

use indexmap::IndexMap;

use crate::ids::{DeviceId, DeviceType, ModuleId, MODULE_MQTT_ID};

/// Initial (and post-heartbeat) value of a device's alive countdown.
pub const ALIVE_CNT: i32 = 3;
pub const TOPIC_MIN_LEN: usize = 3;
pub const TOPIC_MAX_LEN: usize = 30;

/// Outcome of an operation that inserts a new device or module.
///
/// `Oom` is carried over from the original's closed outcome set for parity;
/// a safe Rust `IndexMap::insert` does not fail short of the allocator
/// aborting the process, so this crate never constructs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Ok,
    Duplicate,
    Invalid,
    Oom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Ok,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOutcome {
    Changed,
    Unchanged,
    Invalid,
}

/// A named capability owned by a device, or by the bridge itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: ModuleId,
    pub enabled: bool,
    pub device: DeviceId,
    pub topic: String,
}

/// A remote participant reached through serial or the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub alive: i32,
    pub md_deps: ModuleId,
    pub modules: u32,
    pub topic: Option<String>,
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        self.id.device_type()
    }
}

/// The bridge's own singleton runtime state.
#[derive(Debug, Clone)]
pub struct Bridge {
    pub id: DeviceId,
    pub controller: bool,
    pub serial_ready: bool,
    pub serial_alive: i32,
    pub modules_update: bool,
    pub config_topic: String,
    pub status_topic: String,
}

impl Bridge {
    pub fn new(id: DeviceId) -> Self {
        let config_topic = format!("config/{id}");
        let status_topic = format!("status/{id}");
        Self {
            id,
            controller: false,
            serial_ready: false,
            serial_alive: ALIVE_CNT,
            modules_update: false,
            config_topic,
            status_topic,
        }
    }
}

/// The default per-module publication topic.
pub fn default_module_topic(bridge_id: &DeviceId, module_id: &ModuleId) -> String {
    format!("raw/{bridge_id}/{module_id}")
}

/// The bridge plus the keyed collections of devices and modules it tracks.
pub struct Registry {
    pub bridge: Bridge,
    pub modules: IndexMap<ModuleId, Module>,
    pub devices: IndexMap<DeviceId, Device>,
}

impl Registry {
    pub fn new(bridge_id: DeviceId) -> Self {
        Self {
            bridge: Bridge::new(bridge_id),
            modules: IndexMap::new(),
            devices: IndexMap::new(),
        }
    }

    pub fn add_module(&mut self, module_id: ModuleId, owner: DeviceId) -> AddOutcome {
        if self.modules.contains_key(&module_id) {
            return AddOutcome::Duplicate;
        }
        let topic = default_module_topic(&self.bridge.id, &module_id);
        self.modules.insert(
            module_id.clone(),
            Module {
                id: module_id,
                enabled: true,
                device: owner,
                topic,
            },
        );
        self.bridge.modules_update = true;
        AddOutcome::Ok
    }

    pub fn get_module(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn remove_module(&mut self, id: &ModuleId) -> RemoveOutcome {
        if self.modules.shift_remove(id).is_some() {
            self.bridge.modules_update = true;
            RemoveOutcome::Ok
        } else {
            RemoveOutcome::Missing
        }
    }

    pub fn set_module_topic(&mut self, id: &ModuleId, new_topic: &str) -> TopicOutcome {
        if !(TOPIC_MIN_LEN..=TOPIC_MAX_LEN).contains(&new_topic.len()) {
            return TopicOutcome::Invalid;
        }
        match self.modules.get_mut(id) {
            Some(module) if module.topic == new_topic => TopicOutcome::Unchanged,
            Some(module) => {
                module.topic = new_topic.to_string();
                TopicOutcome::Changed
            }
            None => TopicOutcome::Invalid,
        }
    }

    pub fn set_module_enabled(&mut self, id: &ModuleId, enabled: bool) {
        if let Some(module) = self.modules.get_mut(id) {
            module.enabled = enabled;
        }
    }

    pub fn add_device(&mut self, id: DeviceId, md_deps: ModuleId) -> AddOutcome {
        if self.devices.contains_key(&id) {
            return AddOutcome::Duplicate;
        }
        let topic = (md_deps.as_str() == MODULE_MQTT_ID).then(|| format!("config/{id}"));
        self.devices.insert(
            id.clone(),
            Device {
                id,
                alive: ALIVE_CNT,
                md_deps,
                modules: 0,
                topic,
            },
        );
        AddOutcome::Ok
    }

    pub fn remove_device(&mut self, id: &DeviceId) -> RemoveOutcome {
        if self.devices.shift_remove(id).is_some() {
            RemoveOutcome::Ok
        } else {
            RemoveOutcome::Missing
        }
    }

    pub fn get_device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_device_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn get_device_by_deps(&self, module_id: &ModuleId) -> Option<&Device> {
        self.devices.values().find(|d| &d.md_deps == module_id)
    }

    pub fn enumerate_modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn enumerate_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// True if `device_id` is either a known device or the bridge itself —
    /// the set of valid module owners (invariant 3).
    pub fn is_known_owner(&self, device_id: &DeviceId) -> bool {
        *device_id == self.bridge.id || self.devices.contains_key(device_id)
    }

    /// Removes `module_id` if its owner is neither a known device nor the
    /// bridge. Returns whether it was removed as an orphan.
    pub fn reap_orphan(&mut self, module_id: &ModuleId) -> bool {
        let orphan = match self.modules.get(module_id) {
            Some(module) => !self.is_known_owner(&module.device),
            None => false,
        };
        if orphan {
            self.remove_module(module_id);
        }
        orphan
    }

    /// Refreshes a device's alive countdown after a heartbeat.
    pub fn refresh_alive(&mut self, id: &DeviceId) {
        if let Some(device) = self.devices.get_mut(id) {
            device.alive = ALIVE_CNT;
        }
    }

    /// Updates a device's claimed module count if it changed. Returns
    /// whether it changed, so the caller can trigger the `ST_ALIVE` ->
    /// `ST_MODULES_UP` fall-through.
    pub fn set_device_modules_count(&mut self, id: &DeviceId, count: u32) -> bool {
        match self.devices.get_mut(id) {
            Some(device) if device.modules != count => {
                device.modules = count;
                true
            }
            _ => false,
        }
    }

    /// Decrements every device's alive countdown by one tick. Returns the
    /// ids of devices that just reached zero.
    pub fn tick_alive(&mut self) -> Vec<DeviceId> {
        let mut timed_out = Vec::new();
        for device in self.devices.values_mut() {
            if device.alive > 0 {
                device.alive -= 1;
                if device.alive == 0 {
                    timed_out.push(device.id.clone());
                }
            }
        }
        timed_out
    }

    /// True if any surviving device is of controller type.
    pub fn has_live_controller(&self) -> bool {
        self.devices
            .values()
            .any(|d| d.alive > 0 && d.device_type() == DeviceType::Controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_id() -> DeviceId {
        DeviceId::parse("100000000").unwrap()
    }

    fn serial_module() -> ModuleId {
        ModuleId::parse(crate::ids::MODULE_SERIAL_ID).unwrap()
    }

    #[test]
    fn add_module_sets_default_topic_and_dirty_flag() {
        let mut reg = Registry::new(bridge_id());
        let owner = bridge_id();
        let module_id = ModuleId::parse("012FFA1").unwrap();

        assert_eq!(reg.add_module(module_id.clone(), owner), AddOutcome::Ok);
        assert!(reg.bridge.modules_update);

        let module = reg.get_module(&module_id).unwrap();
        assert_eq!(module.topic, format!("raw/{}/{}", bridge_id(), module_id));
        assert!(module.enabled);
    }

    #[test]
    fn duplicate_module_is_rejected_and_state_unchanged() {
        let mut reg = Registry::new(bridge_id());
        let module_id = ModuleId::parse("012FFA1").unwrap();
        reg.add_module(module_id.clone(), bridge_id());

        let before = reg.get_module(&module_id).cloned();
        assert_eq!(
            reg.add_module(module_id.clone(), bridge_id()),
            AddOutcome::Duplicate
        );
        assert_eq!(reg.get_module(&module_id).cloned(), before);
    }

    #[test]
    fn add_device_bus_reached_gets_config_topic() {
        let mut reg = Registry::new(bridge_id());
        let id = DeviceId::parse("100000002").unwrap();
        let mqtt = ModuleId::parse(crate::ids::MODULE_MQTT_ID).unwrap();

        assert_eq!(reg.add_device(id.clone(), mqtt), AddOutcome::Ok);
        let device = reg.get_device(&id).unwrap();
        assert_eq!(device.alive, ALIVE_CNT);
        assert_eq!(device.topic.as_deref(), Some("config/100000002"));
    }

    #[test]
    fn add_device_serial_reached_has_no_topic() {
        let mut reg = Registry::new(bridge_id());
        let id = DeviceId::parse("000000001").unwrap();

        reg.add_device(id.clone(), serial_module());
        assert_eq!(reg.get_device(&id).unwrap().topic, None);
    }

    #[test]
    fn set_module_topic_rejects_out_of_range_length() {
        let mut reg = Registry::new(bridge_id());
        let module_id = ModuleId::parse("012FFA1").unwrap();
        reg.add_module(module_id.clone(), bridge_id());

        assert_eq!(
            reg.set_module_topic(&module_id, "ab"),
            TopicOutcome::Invalid
        );
        assert_eq!(
            reg.set_module_topic(&module_id, &"x".repeat(31)),
            TopicOutcome::Invalid
        );
    }

    #[test]
    fn set_module_topic_reports_unchanged_on_same_value() {
        let mut reg = Registry::new(bridge_id());
        let module_id = ModuleId::parse("012FFA1").unwrap();
        reg.add_module(module_id.clone(), bridge_id());
        let current = reg.get_module(&module_id).unwrap().topic.clone();

        assert_eq!(
            reg.set_module_topic(&module_id, &current),
            TopicOutcome::Unchanged
        );
        assert_eq!(
            reg.set_module_topic(&module_id, "sensors/temp/kitchen"),
            TopicOutcome::Changed
        );
    }

    #[test]
    fn orphan_module_is_reaped() {
        let mut reg = Registry::new(bridge_id());
        let stray_owner = DeviceId::parse("000000009").unwrap();
        let module_id = ModuleId::parse("012FFA1").unwrap();
        reg.add_module(module_id.clone(), stray_owner);

        assert!(reg.reap_orphan(&module_id));
        assert!(reg.get_module(&module_id).is_none());
    }

    #[test]
    fn known_owner_modules_survive_reap() {
        let mut reg = Registry::new(bridge_id());
        let module_id = ModuleId::parse("012FFA1").unwrap();
        reg.add_module(module_id.clone(), bridge_id());

        assert!(!reg.reap_orphan(&module_id));
        assert!(reg.get_module(&module_id).is_some());
    }

    #[test]
    fn three_drains_without_heartbeat_times_out_exactly_once() {
        let mut reg = Registry::new(bridge_id());
        let id = DeviceId::parse("000000003").unwrap();
        reg.add_device(id.clone(), serial_module());

        assert!(reg.tick_alive().is_empty());
        assert!(reg.tick_alive().is_empty());
        let timed_out = reg.tick_alive();
        assert_eq!(timed_out, vec![id.clone()]);
        assert_eq!(reg.get_device(&id).unwrap().alive, 0);

        // A device already at zero does not go negative or re-report.
        assert!(reg.tick_alive().is_empty());
    }

    #[test]
    fn controller_liveness_tracks_surviving_devices() {
        let mut reg = Registry::new(bridge_id());
        let controller = DeviceId::parse("200000005").unwrap();
        reg.add_device(controller.clone(), serial_module());
        assert!(reg.has_live_controller());

        reg.get_device_mut(&controller).unwrap().alive = 0;
        assert!(!reg.has_live_controller());
    }
}
