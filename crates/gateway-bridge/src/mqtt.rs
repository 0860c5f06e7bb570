//! Bus transport wrapper: one `rumqttc` `AsyncClient`/`EventLoop` pair per
//! bridge, with the bridge's own last-will wired up the way
//! `mosquitto_will_set` did in the original — a timeout announcement on the
//! bridge's own status topic, so peers learn it died even on an unclean
//! exit.

use std::time::Duration;

use gateway_protocol::codec::ProtocolCode;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, QoS};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 128;

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttLink {
    pub client: AsyncClient,
    pub eventloop: EventLoop,
}

fn build_options(bridge_id: &str, host: &str, port: u16, qos: u8, status_topic: &str) -> MqttOptions {
    let mut options = MqttOptions::new(bridge_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    let will_payload = format!("{},{}", ProtocolCode::StTimeout.code(), bridge_id);
    options.set_last_will(LastWill::new(
        status_topic,
        will_payload,
        qos_from_level(qos),
        false,
    ));
    options
}

impl MqttLink {
    pub fn connect(bridge_id: &str, host: &str, port: u16, qos: u8, status_topic: &str) -> Self {
        let options = build_options(bridge_id, host, port, qos, status_topic);
        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        Self { client, eventloop }
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), rumqttc::ClientError> {
        self.client.publish(topic, qos, false, payload).await
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), rumqttc::ClientError> {
        self.client.subscribe(topic, qos).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), rumqttc::ClientError> {
        self.client.unsubscribe(topic).await
    }

    pub async fn poll(&mut self) -> Result<Event, ConnectionError> {
        self.eventloop.poll().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_in_range() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn options_carry_client_id_and_broker() {
        let options = build_options("100000000", "localhost", 1883, 0, "status/100000000");
        assert_eq!(options.client_id(), "100000000");
        assert_eq!(
            options.broker_address(),
            ("localhost".to_string(), 1883)
        );
    }
}
