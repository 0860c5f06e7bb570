//! The 1 Hz tick and the 30-second rollover drain it eventually raises.
//!
//! `LivenessClock` only tracks the rollover counter; `drain` performs the
//! registry-mutating half of the 30-second drain (§4.5) and reports what
//! the controller still needs to act on — the actual publishes and serial
//! writes, since those need the live MQTT/serial handles this module
//! doesn't own.

use gateway_protocol::ids::DeviceId;
use gateway_protocol::registry::Registry;

/// Drives the 30-second rollover: a plain modulo-60 counter advanced once
/// per tick, the same shape as the original's `seconds % 30 == 0` check.
#[derive(Default)]
pub struct LivenessClock {
    seconds: u32,
}

impl LivenessClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances one second. Returns whether the 30-second drain should run.
    pub fn tick(&mut self) -> bool {
        self.seconds = (self.seconds + 1) % 60;
        self.seconds % 30 == 0
    }
}

/// What the controller must still do after a drain: the registry mutations
/// themselves (alive countdowns, the dirty flag, the serial watchdog) have
/// already happened by the time this returns.
pub struct DrainOutcome {
    /// Devices whose alive countdown just reached zero.
    pub timed_out: Vec<DeviceId>,
    /// Publish `PROTO_ST_ALIVE,<modules_len>` on the bridge's status topic.
    pub publish_alive: bool,
    /// Publish `PROTO_ST_MODULES_UP` on the bridge's status topic.
    pub publish_modules_up: bool,
    /// Publish the cached bandwidth sample.
    pub publish_bandwidth: bool,
    /// The serial watchdog just expired; declare a hang.
    pub serial_hang: bool,
    /// Serial is configured but not currently open; attempt to reopen it.
    pub attempt_serial_reopen: bool,
}

/// Runs one 30-second drain against `registry`. `serial_configured` and
/// `bus_connected` describe the transports' current availability.
pub fn drain(registry: &mut Registry, serial_configured: bool, bus_connected: bool) -> DrainOutcome {
    let timed_out = registry.tick_alive();

    if !registry.has_live_controller() {
        registry.bridge.controller = false;
        registry.bridge.modules_update = false;
    }

    let publish_alive = bus_connected;
    let publish_modules_up = bus_connected && registry.bridge.modules_update;
    if publish_modules_up {
        registry.bridge.modules_update = false;
    }

    let serial_hang = if registry.bridge.serial_ready {
        registry.bridge.serial_alive -= 1;
        if registry.bridge.serial_alive <= 0 {
            registry.bridge.serial_ready = false;
            registry.bridge.serial_alive = 0;
            true
        } else {
            false
        }
    } else {
        false
    };

    let attempt_serial_reopen = serial_configured && !registry.bridge.serial_ready;

    DrainOutcome {
        timed_out,
        publish_alive,
        publish_modules_up,
        publish_bandwidth: bus_connected,
        serial_hang,
        attempt_serial_reopen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_protocol::ids::{ModuleId, MODULE_MQTT_ID, MODULE_SERIAL_ID};

    fn bridge_id() -> DeviceId {
        DeviceId::parse("100000000").unwrap()
    }

    #[test]
    fn rollover_fires_every_thirty_ticks() {
        let mut clock = LivenessClock::new();
        let fired: Vec<bool> = (0..60).map(|_| clock.tick()).collect();
        let fired_at: Vec<usize> = fired
            .iter()
            .enumerate()
            .filter(|(_, &f)| f)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fired_at, vec![29, 59]);
    }

    #[test]
    fn drain_reports_timeouts() {
        let mut reg = Registry::new(bridge_id());
        let id = DeviceId::parse("000000003").unwrap();
        let serial = ModuleId::parse(MODULE_SERIAL_ID).unwrap();
        reg.add_device(id.clone(), serial);
        reg.get_device_mut(&id).unwrap().alive = 1;

        let outcome = drain(&mut reg, true, true);
        assert_eq!(outcome.timed_out, vec![id]);
    }

    #[test]
    fn drain_clears_modules_update_without_live_controller() {
        let mut reg = Registry::new(bridge_id());
        reg.bridge.modules_update = true;

        let outcome = drain(&mut reg, false, true);
        assert!(!reg.bridge.modules_update);
        assert!(!outcome.publish_modules_up);
    }

    #[test]
    fn drain_publishes_modules_up_once_and_clears_flag() {
        let mut reg = Registry::new(bridge_id());
        let controller = DeviceId::parse("200000001").unwrap();
        let mqtt = ModuleId::parse(MODULE_MQTT_ID).unwrap();
        reg.add_device(controller, mqtt);
        reg.bridge.modules_update = true;

        let outcome = drain(&mut reg, false, true);
        assert!(outcome.publish_modules_up);
        assert!(!reg.bridge.modules_update);
    }

    #[test]
    fn serial_hang_declared_after_watchdog_expires() {
        let mut reg = Registry::new(bridge_id());
        reg.bridge.serial_ready = true;
        reg.bridge.serial_alive = 1;

        let outcome = drain(&mut reg, true, true);
        assert!(outcome.serial_hang);
        assert!(!reg.bridge.serial_ready);
    }

    #[test]
    fn reopen_is_requested_when_configured_but_not_ready() {
        let mut reg = Registry::new(bridge_id());
        reg.bridge.serial_ready = false;

        let outcome = drain(&mut reg, true, true);
        assert!(outcome.attempt_serial_reopen);
    }
}
