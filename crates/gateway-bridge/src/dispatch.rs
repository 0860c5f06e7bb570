//! The protocol dispatcher: turns one decoded [`Frame`] plus the current
//! [`Registry`] state into the list of outbound [`Action`]s the controller
//! must carry out.
//!
//! Dispatch itself is synchronous and side-effect-free beyond registry
//! mutation — it never touches the network, the serial port, or the
//! filesystem. Anything that needs real I/O (a script run, a bandwidth
//! sample, a publish, a serial write) comes back as an `Action` for the
//! controller to execute against the transports it owns. This split is what
//! makes the dispatcher directly unit-testable without a broker or a port.
//!
//! By the time a frame reaches `dispatch`, the device it came from has
//! already been resolved or created by the controller's ingress handling —
//! the same division the original keeps between `on_mqtt_message`/
//! `serial_in` (device lookup/creation) and `bridge_message` (everything
//! after).

use gateway_protocol::codec::{
    format_machine_frame, format_peer_frame, format_status_frame, read_integer, read_string, Frame,
    ProtocolCode,
};
use gateway_protocol::ids::{DeviceId, DeviceType, ModuleId, ModuleType, MODULE_ID_LEN};
use gateway_protocol::registry::{Module, Registry, TopicOutcome};

/// An effect dispatch decided on but cannot carry out itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Publish `payload` on `topic` over the bus.
    PublishBus { topic: String, payload: String },
    /// Write a `M:`-framed line to the serial port.
    WriteSerial { line: String },
    /// Persist a device's current state to its device file.
    SaveDevice { device_id: DeviceId },
    /// Run `name` under the scripts folder and publish its first output line
    /// (or a fallback digit) to `topic`.
    RunScript { topic: String, name: String },
    /// Sample the configured interface's bandwidth and publish `up,down` to
    /// `topic`.
    SampleBandwidth { topic: String },
}

/// Dispatches one frame received from `source`. `bandwidth_enabled` reflects
/// whether the bridge was configured with an interface to sample.
pub fn dispatch(
    registry: &mut Registry,
    source: &DeviceId,
    frame: &Frame,
    bandwidth_enabled: bool,
) -> Vec<Action> {
    let mut actions = Vec::new();

    match frame.code {
        ProtocolCode::Error
        | ProtocolCode::Ack
        | ProtocolCode::Nack
        | ProtocolCode::StTimeout
        | ProtocolCode::Device
        | ProtocolCode::RemoveDevice => {}

        // The fall-through from ST_ALIVE into ST_MODULES_UP below is
        // intentional: a heartbeat that reports a changed module count
        // immediately re-requests the module list, same as the original.
        ProtocolCode::StAlive => {
            if handle_st_alive(registry, source, &frame.rest) {
                handle_st_modules_up(registry, source, &mut actions);
            }
        }
        ProtocolCode::StModulesUp => handle_st_modules_up(registry, source, &mut actions),

        ProtocolCode::GetModules => handle_get_modules(registry, source, &mut actions),
        ProtocolCode::GetDevices => handle_get_devices(registry, source, &mut actions),
        ProtocolCode::SaveDevice => handle_save_device(registry, &frame.rest, &mut actions),

        _ => handle_module_scoped(registry, source, frame, bandwidth_enabled, &mut actions),
    }

    actions
}

/// Updates the source device's claimed module count. Returns whether it
/// changed, triggering the fall-through into `ST_MODULES_UP`.
fn handle_st_alive(registry: &mut Registry, source: &DeviceId, rest: &str) -> bool {
    let Some((count, _)) = read_integer(rest.as_bytes()) else {
        return false;
    };
    registry.set_device_modules_count(source, count.max(0) as u32)
}

/// Re-requests a node's module list, routed by how it was reached.
fn handle_st_modules_up(registry: &Registry, source: &DeviceId, actions: &mut Vec<Action>) {
    let Some(dev) = registry.get_device(source) else {
        return;
    };
    if dev.device_type() != DeviceType::Node {
        return;
    }
    match dev.md_deps.module_type() {
        ModuleType::Serial if registry.bridge.serial_ready => {
            actions.push(Action::WriteSerial {
                line: format_machine_frame(dev.id.as_str(), ProtocolCode::GetModules, &[]),
            });
        }
        ModuleType::Mqtt => {
            if let Some(topic) = &dev.topic {
                actions.push(Action::PublishBus {
                    topic: topic.clone(),
                    payload: format_peer_frame(
                        registry.bridge.id.as_str(),
                        ProtocolCode::GetModules,
                        &[],
                    ),
                });
            }
        }
        _ => {}
    }
}

/// Replies on the bus with one `MODULE` descriptor per known module.
fn handle_get_modules(registry: &Registry, source: &DeviceId, actions: &mut Vec<Action>) {
    let Some(dev) = registry.get_device(source) else {
        return;
    };
    if dev.md_deps.module_type() != ModuleType::Mqtt {
        return;
    }
    let Some(topic) = dev.topic.clone() else {
        return;
    };
    for module in registry.enumerate_modules() {
        actions.push(Action::PublishBus {
            topic: topic.clone(),
            payload: format_peer_frame(
                registry.bridge.id.as_str(),
                ProtocolCode::Module,
                &[
                    module.id.as_str(),
                    module.device.as_str(),
                    enabled_flag(module.enabled),
                ],
            ),
        });
    }
}

/// Replies on the bus with one `DEVICE` descriptor per known device.
fn handle_get_devices(registry: &Registry, source: &DeviceId, actions: &mut Vec<Action>) {
    let Some(dev) = registry.get_device(source) else {
        return;
    };
    if dev.md_deps.module_type() != ModuleType::Mqtt {
        return;
    }
    let Some(topic) = dev.topic.clone() else {
        return;
    };
    for target in registry.enumerate_devices() {
        actions.push(Action::PublishBus {
            topic: topic.clone(),
            payload: format_peer_frame(
                registry.bridge.id.as_str(),
                ProtocolCode::Device,
                &[
                    target.id.as_str(),
                    &target.modules.to_string(),
                    &target.alive.to_string(),
                ],
            ),
        });
    }
}

/// Persists a known device; unknown ids are silently ignored.
fn handle_save_device(registry: &Registry, rest: &str, actions: &mut Vec<Action>) {
    let Some(device_id) = DeviceId::parse(rest) else {
        return;
    };
    if registry.get_device(&device_id).is_none() {
        return;
    }
    actions.push(Action::SaveDevice { device_id });
}

/// Handles every remaining code, all of which carry a module id as their
/// first field. `MdEnable`/`MdGetEnable`/`MdSetEnable`/`MdSetId` still run
/// the module lookup and orphan check below but otherwise do nothing —
/// carried over unimplemented from the original.
fn handle_module_scoped(
    registry: &mut Registry,
    source: &DeviceId,
    frame: &Frame,
    bandwidth_enabled: bool,
    actions: &mut Vec<Action>,
) {
    let Some((module_id, msg)) = extract_module_id(&frame.rest) else {
        tracing::debug!(code = ?frame.code, "missing or invalid module id");
        return;
    };

    if frame.code == ProtocolCode::Module {
        if registry.get_module(&module_id).is_none() {
            registry.add_module(module_id, source.clone());
        }
        return;
    }

    if registry.reap_orphan(&module_id) {
        tracing::warn!(module = %module_id, "orphan module reaped");
        return;
    }
    let Some(module) = registry.get_module(&module_id).cloned() else {
        return;
    };

    match frame.code {
        ProtocolCode::GetModule => {
            if let Some(topic) = mqtt_source_topic(registry, source) {
                actions.push(Action::PublishBus {
                    topic,
                    payload: format_peer_frame(
                        registry.bridge.id.as_str(),
                        ProtocolCode::Module,
                        &[
                            module.id.as_str(),
                            module.device.as_str(),
                            enabled_flag(module.enabled),
                        ],
                    ),
                });
            }
        }
        ProtocolCode::MdGetTopic => {
            if let Some(topic) = mqtt_source_topic(registry, source) {
                actions.push(Action::PublishBus {
                    topic,
                    payload: format_peer_frame(
                        registry.bridge.id.as_str(),
                        ProtocolCode::MdTopic,
                        &[module.id.as_str(), &module.topic],
                    ),
                });
            }
        }
        ProtocolCode::MdTopic | ProtocolCode::MdSetTopic => {
            if registry.set_module_topic(&module_id, &msg) == TopicOutcome::Changed {
                actions.push(Action::PublishBus {
                    topic: registry.bridge.status_topic.clone(),
                    payload: format_status_frame(
                        ProtocolCode::MdTopic,
                        &[module_id.as_str(), &msg],
                    ),
                });
            }
        }
        ProtocolCode::MdRaw => {
            actions.push(Action::PublishBus {
                topic: module.topic.clone(),
                payload: msg,
            });
        }
        ProtocolCode::MdToRaw => {
            dispatch_md_to_raw(registry, &module, &module_id, &msg, bandwidth_enabled, actions)
        }
        _ => {}
    }
}

/// Routes `MD_TO_RAW`: to the owning device if it is reached over serial or
/// the bus, or dispatched locally by the module's own type if the bridge
/// owns it.
fn dispatch_md_to_raw(
    registry: &Registry,
    module: &Module,
    module_id: &ModuleId,
    msg: &str,
    bandwidth_enabled: bool,
    actions: &mut Vec<Action>,
) {
    if let Some(target_dev) = registry.get_device(&module.device) {
        match target_dev.md_deps.module_type() {
            ModuleType::Serial if registry.bridge.serial_ready => {
                actions.push(Action::WriteSerial {
                    line: format_machine_frame(
                        target_dev.id.as_str(),
                        ProtocolCode::MdToRaw,
                        &[module.id.as_str(), msg],
                    ),
                });
            }
            ModuleType::Mqtt => {
                if let Some(topic) = &target_dev.topic {
                    actions.push(Action::PublishBus {
                        topic: topic.clone(),
                        payload: format_peer_frame(
                            registry.bridge.id.as_str(),
                            ProtocolCode::MdToRaw,
                            &[module.id.as_str(), msg],
                        ),
                    });
                }
            }
            _ => {}
        }
        return;
    }

    if module.device != registry.bridge.id {
        return;
    }

    match module_id.module_type() {
        ModuleType::Script => actions.push(Action::RunScript {
            topic: module.topic.clone(),
            name: msg.to_string(),
        }),
        ModuleType::Bandwidth => {
            if bandwidth_enabled {
                actions.push(Action::SampleBandwidth {
                    topic: module.topic.clone(),
                });
            }
        }
        ModuleType::Serial => actions.push(Action::PublishBus {
            topic: module.topic.clone(),
            payload: enabled_flag(registry.bridge.serial_ready).to_string(),
        }),
        _ => {}
    }
}

/// The source device's own config topic, if it is reached over the bus.
fn mqtt_source_topic(registry: &Registry, source: &DeviceId) -> Option<String> {
    let dev = registry.get_device(source)?;
    if dev.md_deps.module_type() != ModuleType::Mqtt {
        return None;
    }
    dev.topic.clone()
}

fn enabled_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Pulls a leading module id off `rest`, returning it along with whatever
/// follows.
fn extract_module_id(rest: &str) -> Option<(ModuleId, String)> {
    let (md_str, consumed) = read_string(rest.as_bytes(), MODULE_ID_LEN, b',')?;
    let module_id = ModuleId::parse(&md_str)?;
    Some((module_id, rest[consumed..].to_string()))
}
