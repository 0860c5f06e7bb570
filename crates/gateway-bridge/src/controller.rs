//! The bridge controller: the single-task event loop that multiplexes serial
//! ingress, bus ingress, user signals, and the 1 Hz liveness tick, and turns
//! each into registry mutations plus the transport effects they demand.
//!
//! Device resolution on ingress (look up, load from disk, or create) happens
//! here rather than in `dispatch`, the same division the original keeps
//! between `on_mqtt_message`/`serial_in` and `bridge_message`.

use std::time::{Duration, Instant};

use rumqttc::{Event, Incoming, QoS};
use tokio::time::interval;

use gateway_protocol::codec::{
    read_string, Frame, ProtocolCode, SerialFrameKind, SerialMessage,
};
use gateway_protocol::ids::{
    DeviceId, DeviceType, ModuleId, ModuleType, DEVICE_ID_LEN, MODULE_BANDWIDTH_ID,
    MODULE_MQTT_ID, MODULE_SERIAL_ID, MODULE_SIGUSR1_ID, MODULE_SIGUSR2_ID,
};
use gateway_protocol::persistence::{self, LoadOutcome};
use gateway_protocol::registry::{AddOutcome, Registry};

use crate::bandwidth::BandwidthSampler;
use crate::config::BridgeConfig;
use crate::dispatch::{self, Action};
use crate::mqtt::MqttLink;
use crate::script::{self, ScriptOutcome};
use crate::serial::SerialLink;
use crate::signals::{SignalResolver, SignalStreams, UserSignal};

/// Owns every live resource the event loop drives: the registry, both
/// transports, the signal plumbing, and the liveness clock.
pub struct Controller {
    config: BridgeConfig,
    registry: Registry,
    mqtt: MqttLink,
    bus_connected: bool,
    serial: Option<SerialLink>,
    bandwidth: Option<BandwidthSampler>,
    signals: SignalStreams,
    resolver: SignalResolver,
    clock: crate::liveness::LivenessClock,
    qos: QoS,
}

impl Controller {
    pub fn new(
        config: BridgeConfig,
        registry: Registry,
        mqtt: MqttLink,
        serial: Option<SerialLink>,
        bandwidth: Option<BandwidthSampler>,
        signals: SignalStreams,
    ) -> Self {
        let qos = crate::mqtt::qos_from_level(config.mqtt_qos);
        Self {
            config,
            registry,
            mqtt,
            bus_connected: false,
            serial,
            bandwidth,
            signals,
            resolver: SignalResolver::new(),
            clock: crate::liveness::LivenessClock::new(),
            qos,
        }
    }

    /// Runs until a termination signal is observed. Mirrors §5's shutdown
    /// discipline: the loop exits after finishing the iteration that saw the
    /// signal, then resources are dropped in the reverse of their
    /// construction order by ordinary `Drop`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut liveness_tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                biased;

                _ = self.signals.sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = self.signals.sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }

                line = recv_serial_line(&mut self.serial) => {
                    if let Some(line) = line {
                        self.handle_serial_line(line).await;
                    } else {
                        self.handle_serial_hang().await;
                    }
                }

                _ = self.signals.sigusr1.recv() => {
                    self.resolver.on_usr1(Instant::now());
                }
                _ = self.signals.sigusr2.recv() => {
                    if let Some(resolved) = self.resolver.on_usr2(Instant::now()) {
                        self.handle_user_signal(resolved).await;
                    }
                }

                event = self.mqtt.poll() => {
                    self.handle_mqtt_event(event).await;
                }

                _ = liveness_tick.tick() => {
                    if self.clock.tick() {
                        self.run_drain().await;
                    }
                }
            }
        }

        if let Some(serial) = self.serial.take() {
            drop(serial);
        }
        Ok(())
    }

    async fn handle_serial_line(&mut self, line: std::io::Result<String>) {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "serial read error");
                self.handle_serial_hang().await;
                return;
            }
        };
        self.registry.bridge.serial_alive = gateway_protocol::registry::ALIVE_CNT;

        let trimmed = line.trim_end_matches(['\n', '\r']);
        let Some((kind, rest)) = SerialFrameKind::parse_prefix(trimmed) else {
            return;
        };
        if kind != SerialFrameKind::Machine {
            tracing::debug!(line = rest, "serial debug line");
            return;
        }
        let Some(msg) = SerialMessage::parse(rest) else {
            tracing::debug!(payload = rest, "invalid serial message");
            return;
        };
        let Some(device_id) = DeviceId::parse(&msg.device_id) else {
            tracing::debug!(id = msg.device_id, "invalid serial device id");
            return;
        };

        let serial_module = ModuleId::parse(MODULE_SERIAL_ID).expect("fixed id is valid");
        self.resolve_device(&device_id, serial_module).await;
        self.run_dispatch(&device_id, &msg.frame).await;
    }

    async fn handle_serial_hang(&mut self) {
        if !self.registry.bridge.serial_ready {
            return;
        }
        self.registry.bridge.serial_ready = false;
        self.registry.bridge.serial_alive = 0;
        self.serial = None;
        if self.bus_connected {
            let serial_id = ModuleId::parse(MODULE_SERIAL_ID).expect("fixed id is valid");
            if let Some(module) = self.registry.get_module(&serial_id) {
                let topic = module.topic.clone();
                publish(&self.mqtt, self.qos, &topic, "0").await;
            }
        }
    }

    async fn handle_mqtt_event(&mut self, event: Result<Event, rumqttc::ConnectionError>) {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                self.bus_connected = true;
                tracing::info!("MQTT connected");
                if let Err(error) = self
                    .mqtt
                    .subscribe(&self.registry.bridge.config_topic, self.qos)
                    .await
                {
                    tracing::error!(%error, "failed to subscribe to config topic");
                }
                let payload = gateway_protocol::codec::format_status_frame(
                    ProtocolCode::StAlive,
                    &[&self.registry.modules.len().to_string()],
                );
                let status_topic = self.registry.bridge.status_topic.clone();
                publish(&self.mqtt, self.qos, &status_topic, &payload).await;
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                self.bus_connected = false;
                self.registry.bridge.controller = false;
                tracing::warn!("MQTT disconnected");
            }
            Ok(Event::Incoming(Incoming::Publish(pkt))) => {
                self.handle_bus_publish(&pkt.topic, &pkt.payload).await;
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(%error, "MQTT loop error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn handle_bus_publish(&mut self, topic: &str, payload: &[u8]) {
        let payload = String::from_utf8_lossy(payload).into_owned();

        let (device_id, body) = if topic == self.registry.bridge.config_topic {
            let Some((id_str, consumed)) =
                read_string(payload.as_bytes(), DEVICE_ID_LEN, b',')
            else {
                tracing::debug!("bus message on config topic with no device id");
                return;
            };
            let Some(id) = DeviceId::parse(&id_str) else {
                tracing::debug!(id = id_str, "invalid bus device id");
                return;
            };
            (id, payload[consumed..].to_string())
        } else if let Some(id_str) = topic.strip_prefix("status/") {
            let Some(id) = DeviceId::parse(id_str) else {
                tracing::debug!(id = id_str, "invalid status topic device id");
                return;
            };
            (id, payload)
        } else {
            return;
        };

        let Some(frame) = Frame::parse(&body) else {
            tracing::debug!(payload = body, "invalid bus frame");
            return;
        };

        let mqtt_module = ModuleId::parse(MODULE_MQTT_ID).expect("fixed id is valid");
        self.resolve_device(&device_id, mqtt_module).await;
        self.run_dispatch(&device_id, &frame).await;
    }

    /// Looks up `device_id`, loading it from disk or creating it fresh if
    /// unseen, and subscribes to its status topic if it is a newly observed
    /// bus node. An already-known device just has its heartbeat refreshed.
    async fn resolve_device(&mut self, device_id: &DeviceId, md_deps: ModuleId) {
        if self.registry.get_device(device_id).is_some() {
            self.registry.refresh_alive(device_id);
            return;
        }

        let outcome =
            persistence::load_device(&mut self.registry, &self.config.devices_folder, device_id)
                .await;
        match outcome {
            LoadOutcome::Loaded => {}
            LoadOutcome::Invalid => {
                tracing::warn!(id = %device_id, "device file failed to parse");
                return;
            }
            LoadOutcome::NotFound => {
                if self.registry.add_device(device_id.clone(), md_deps) != AddOutcome::Ok {
                    return;
                }
            }
        }

        // Either path just made this device known to the registry for the
        // first time this process has seen it, so it still needs the
        // subscribe-on-discovery / controller-flag bookkeeping below.
        let Some(device) = self.registry.get_device(device_id) else {
            return;
        };
        let md_deps_type = device.md_deps.module_type();
        match device.device_type() {
            DeviceType::Node if md_deps_type == ModuleType::Mqtt => {
                let status_topic = format!("status/{device_id}");
                if let Err(error) = self.mqtt.subscribe(&status_topic, self.qos).await {
                    tracing::error!(%error, topic = status_topic, "failed to subscribe");
                }
            }
            DeviceType::Node => {}
            DeviceType::Controller => {
                self.registry.bridge.controller = true;
            }
            DeviceType::Bridge => {}
        }
    }

    async fn run_dispatch(&mut self, source: &DeviceId, frame: &Frame) {
        let actions = dispatch::dispatch(
            &mut self.registry,
            source,
            frame,
            self.bandwidth.is_some(),
        );
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::PublishBus { topic, payload } => {
                publish(&self.mqtt, self.qos, &topic, &payload).await
            }
            Action::WriteSerial { line } => {
                if let Some(serial) = self.serial.as_mut() {
                    if let Err(error) = serial.write_line(&line) {
                        tracing::warn!(%error, "serial write failed");
                    }
                }
            }
            Action::SaveDevice { device_id } => {
                if let Err(error) =
                    persistence::save_device(&self.registry, &self.config.devices_folder, &device_id)
                        .await
                {
                    tracing::warn!(%error, id = %device_id, "failed to persist device");
                }
            }
            Action::RunScript { topic, name } => {
                let outcome = script::run_script(&self.config.scripts_folder, &name).await;
                let payload = match outcome {
                    ScriptOutcome::Output(line) => line,
                    ScriptOutcome::NoOutput => "1".to_string(),
                    ScriptOutcome::Invalid | ScriptOutcome::Failed => "0".to_string(),
                };
                publish(&self.mqtt, self.qos, &topic, &payload).await;
            }
            Action::SampleBandwidth { topic } => {
                if let Some(sampler) = self.bandwidth.as_mut() {
                    if let Some((up, down)) = sampler.sample().await {
                        publish(&self.mqtt, self.qos, &topic, &format!("{up},{down}")).await;
                    }
                }
            }
        }
    }

    async fn handle_user_signal(&mut self, signal: UserSignal) {
        let default_id = match signal {
            UserSignal::Usr1 => MODULE_SIGUSR1_ID,
            UserSignal::Usr2 => MODULE_SIGUSR2_ID,
        };
        let remapped = match signal {
            UserSignal::Usr1 => self.config.remap_usr1.as_deref(),
            UserSignal::Usr2 => self.config.remap_usr2.as_deref(),
        };
        let Some(module_id) = ModuleId::parse(remapped.unwrap_or(default_id)) else {
            tracing::warn!(id = remapped.unwrap_or(default_id), "invalid remap module id");
            return;
        };

        let Some(module) = self.registry.get_module(&module_id).cloned() else {
            return;
        };
        if self.registry.reap_orphan(&module_id) {
            tracing::warn!(module = %module_id, "orphan sigusr module reaped");
            return;
        }

        if let Some(owner) = self.registry.get_device(&module.device) {
            if owner.md_deps.module_type() == ModuleType::Serial && self.registry.bridge.serial_ready
            {
                if let Some(serial) = self.serial.as_mut() {
                    let line = gateway_protocol::codec::format_machine_frame(
                        owner.id.as_str(),
                        ProtocolCode::MdRaw,
                        &[module.id.as_str()],
                    );
                    if let Err(error) = serial.write_line(&line) {
                        tracing::warn!(%error, "serial write failed");
                    }
                }
            }
        }
        if self.bus_connected {
            let topic = module.topic.clone();
            publish(&self.mqtt, self.qos, &topic, "1").await;
        }
    }

    async fn run_drain(&mut self) {
        let outcome = crate::liveness::drain(
            &mut self.registry,
            self.config.serial.is_some(),
            self.bus_connected,
        );

        for device_id in &outcome.timed_out {
            let payload = gateway_protocol::codec::format_status_frame(
                ProtocolCode::StTimeout,
                &[device_id.as_str()],
            );
            let status_topic = self.registry.bridge.status_topic.clone();
            publish(&self.mqtt, self.qos, &status_topic, &payload).await;
            tracing::info!(id = %device_id, "device timed out");

            let should_unsubscribe = self.registry.get_device(device_id).is_some_and(|dev| {
                dev.device_type() == DeviceType::Node
                    && dev.md_deps.module_type() == ModuleType::Mqtt
            });
            if should_unsubscribe {
                let status_peer_topic = format!("status/{device_id}");
                if let Err(error) = self.mqtt.unsubscribe(&status_peer_topic).await {
                    tracing::warn!(%error, topic = status_peer_topic, "failed to unsubscribe");
                }
            }
        }

        if outcome.publish_alive {
            let payload = gateway_protocol::codec::format_status_frame(
                ProtocolCode::StAlive,
                &[&self.registry.modules.len().to_string()],
            );
            let status_topic = self.registry.bridge.status_topic.clone();
            publish(&self.mqtt, self.qos, &status_topic, &payload).await;
        }
        if outcome.publish_modules_up {
            let payload =
                gateway_protocol::codec::format_status_frame(ProtocolCode::StModulesUp, &[]);
            let status_topic = self.registry.bridge.status_topic.clone();
            publish(&self.mqtt, self.qos, &status_topic, &payload).await;
        }

        if outcome.publish_bandwidth {
            if let Some(sampler) = self.bandwidth.as_mut() {
                let bandwidth_id = ModuleId::parse(MODULE_BANDWIDTH_ID).expect("fixed id is valid");
                if let Some(module) = self.registry.get_module(&bandwidth_id) {
                    let topic = module.topic.clone();
                    if let Some((up, down)) = sampler.sample().await {
                        publish(&self.mqtt, self.qos, &topic, &format!("{up},{down}")).await;
                    }
                }
            }
        }

        if outcome.serial_hang {
            self.handle_serial_hang().await;
        }
        if outcome.attempt_serial_reopen {
            self.reopen_serial().await;
        }
    }

    async fn reopen_serial(&mut self) {
        let Some(serial_cfg) = self.config.serial.clone() else {
            return;
        };
        match SerialLink::open(&serial_cfg) {
            Ok(link) => {
                self.serial = Some(link);
                self.registry.bridge.serial_ready = true;
                self.registry.bridge.serial_alive = gateway_protocol::registry::ALIVE_CNT;
                tracing::info!("serial reopened");
            }
            Err(error) => {
                tracing::debug!(%error, "failed to reopen serial port");
            }
        }
    }
}

/// Publishes through `mqtt` directly rather than as a `&self` method, so
/// callers can hold a live borrow of another field (the bandwidth sampler,
/// in particular) across the call without the borrow checker treating it as
/// aliasing the whole controller.
async fn publish(mqtt: &MqttLink, qos: QoS, topic: &str, payload: &str) {
    if let Err(error) = mqtt.publish(topic, qos, payload.to_string()).await {
        tracing::warn!(%error, topic, "failed to publish");
    }
}

/// Awaits the next serial line, or never resolves if serial isn't configured
/// — the usual trick for making a `tokio::select!` branch conditional on an
/// `Option` without re-borrowing the receiver on every poll.
async fn recv_serial_line(
    serial: &mut Option<SerialLink>,
) -> Option<std::io::Result<String>> {
    match serial {
        Some(link) => link.lines.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use gateway_protocol::ids::MODULE_SIGUSR1_ID;

    fn bridge_id() -> DeviceId {
        DeviceId::parse("100000000").unwrap()
    }

    fn test_config(id: DeviceId) -> BridgeConfig {
        BridgeConfig {
            debug: 0,
            id,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_qos: 0,
            devices_folder: PathBuf::from("/nonexistent-gateway-bridge-test-devices"),
            scripts_folder: PathBuf::from("/nonexistent-gateway-bridge-test-scripts"),
            interface: None,
            serial: None,
            remap_usr1: None,
            remap_usr2: None,
        }
    }

    fn test_controller() -> Controller {
        let id = bridge_id();
        let config = test_config(id.clone());
        let registry = Registry::new(id.clone());
        let mqtt = MqttLink::connect(id.as_str(), "localhost", 1883, 0, &format!("status/{id}"));
        let qos = crate::mqtt::qos_from_level(config.mqtt_qos);
        Controller {
            config,
            registry,
            mqtt,
            bus_connected: true,
            serial: None,
            bandwidth: None,
            signals: SignalStreams::new().expect("signal handlers"),
            resolver: SignalResolver::new(),
            clock: crate::liveness::LivenessClock::new(),
            qos,
        }
    }

    #[tokio::test]
    async fn resolve_device_creates_unknown_device_and_subscribes() {
        let mut controller = test_controller();
        let id = DeviceId::parse("000000003").unwrap();
        let mqtt_module = ModuleId::parse(MODULE_MQTT_ID).unwrap();

        controller.resolve_device(&id, mqtt_module).await;

        let device = controller.registry.get_device(&id).unwrap();
        assert_eq!(device.device_type(), DeviceType::Node);
        assert_eq!(device.topic.as_deref(), Some("config/000000003"));
    }

    #[tokio::test]
    async fn resolve_device_refreshes_alive_on_already_known_device() {
        let mut controller = test_controller();
        let id = DeviceId::parse("000000003").unwrap();
        let mqtt_module = ModuleId::parse(MODULE_MQTT_ID).unwrap();
        controller.registry.add_device(id.clone(), mqtt_module.clone());
        controller.registry.get_device_mut(&id).unwrap().alive = 0;

        controller.resolve_device(&id, mqtt_module).await;

        assert_eq!(
            controller.registry.get_device(&id).unwrap().alive,
            gateway_protocol::registry::ALIVE_CNT
        );
    }

    #[tokio::test]
    async fn resolve_device_does_not_subscribe_a_serial_reached_node() {
        let mut controller = test_controller();
        let id = DeviceId::parse("000000003").unwrap();
        let serial_module = ModuleId::parse(MODULE_SERIAL_ID).unwrap();

        controller.resolve_device(&id, serial_module).await;

        let device = controller.registry.get_device(&id).unwrap();
        assert_eq!(device.device_type(), DeviceType::Node);
        assert_eq!(device.md_deps.module_type(), ModuleType::Serial);
        // Only MQTT-reached nodes get a status/<id> subscription; a serial
        // node has no bus topic of its own to subscribe to.
        assert_eq!(device.topic, None);
    }

    #[tokio::test]
    async fn bus_publish_on_bridge_config_topic_extracts_sender_id_from_payload() {
        let mut controller = test_controller();
        let config_topic = controller.registry.bridge.config_topic.clone();

        controller
            .handle_bus_publish(&config_topic, b"000000003,3,4")
            .await;

        let device = controller.registry.get_device(&DeviceId::parse("000000003").unwrap());
        let device = device.expect("sender id parsed out of the payload");
        assert_eq!(device.modules, 4);
    }

    #[tokio::test]
    async fn bus_publish_on_peer_status_topic_extracts_sender_id_from_topic() {
        let mut controller = test_controller();

        controller
            .handle_bus_publish("status/000000007", b"3,2")
            .await;

        let device = controller.registry.get_device(&DeviceId::parse("000000007").unwrap());
        let device = device.expect("sender id parsed out of the topic");
        assert_eq!(device.modules, 2);
    }

    #[tokio::test]
    async fn bus_publish_on_unrelated_topic_is_ignored() {
        let mut controller = test_controller();

        controller
            .handle_bus_publish("raw/100000000/012FFA1", b"1")
            .await;

        assert!(controller.registry.devices.is_empty());
    }

    #[tokio::test]
    async fn user_signal_reaps_an_orphaned_sigusr_module() {
        let mut controller = test_controller();
        let module_id = ModuleId::parse(MODULE_SIGUSR1_ID).unwrap();
        let stray_owner = DeviceId::parse("000000009").unwrap();
        controller.registry.add_module(module_id.clone(), stray_owner);

        controller.handle_user_signal(UserSignal::Usr1).await;

        assert!(controller.registry.get_module(&module_id).is_none());
    }

    #[tokio::test]
    async fn user_signal_leaves_a_bridge_owned_module_in_place() {
        let mut controller = test_controller();
        let module_id = ModuleId::parse(MODULE_SIGUSR1_ID).unwrap();
        controller
            .registry
            .add_module(module_id.clone(), bridge_id());

        controller.handle_user_signal(UserSignal::Usr1).await;

        assert!(controller.registry.get_module(&module_id).is_some());
    }
}
