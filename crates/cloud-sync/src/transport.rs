//! Broker transport

use crate::{PublishConfig, PublishError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection to a message broker with acknowledged delivery
#[async_trait]
pub trait Transport: Send {
    /// (Re)establish the session, replacing any previous one
    async fn connect(&mut self) -> Result<(), PublishError>;

    /// Resolves once the broker acknowledges the message
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// False once the session has been observed to drop
    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self);
}

enum Delivery {
    Sent(u16),
    Acked(u16),
}

struct Session {
    client: AsyncClient,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    connected: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

/// MQTT 3.1.1 transport over rumqttc
pub struct MqttTransport {
    client_id: String,
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
    publish_timeout: Duration,
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new(config: &PublishConfig, gateway_id: &str) -> Self {
        let client_id = if config.client_id.is_empty() {
            format!("gateway-{}", gateway_id)
        } else {
            config.client_id.clone()
        };
        info!(
            "MQTT transport for {}:{} as {}",
            config.broker_host, config.broker_port, client_id
        );
        Self {
            client_id,
            host: config.broker_host.clone(),
            port: config.broker_port,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
            session: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.connected.store(false, Ordering::Relaxed);
            session.driver.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), PublishError> {
        self.teardown();

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(PublishError::Connection(e.to_string())),
                }
            }
        };
        let ack = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| PublishError::Connection(format!("no CONNACK within {:?}", self.connect_timeout)))??;
        debug!("CONNACK: {:?}", ack.code);

        let connected = Arc::new(AtomicBool::new(true));
        let (tx, deliveries) = mpsc::unbounded_channel();
        let flag = connected.clone();
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = tx.send(Delivery::Sent(pkid));
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        let _ = tx.send(Delivery::Acked(ack.pkid));
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker closed the session");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection lost: {}", e);
                        break;
                    }
                }
            }
            flag.store(false, Ordering::Relaxed);
        });

        self.session = Some(Session {
            client,
            deliveries,
            connected,
            driver,
        });
        info!("Connected to MQTT broker {}:{}", self.host, self.port);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;
        if !session.connected.load(Ordering::Relaxed) {
            return Err(PublishError::ConnectionLost);
        }

        // Late acknowledgments from abandoned attempts
        while session.deliveries.try_recv().is_ok() {}

        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;

        let deliveries = &mut session.deliveries;
        let acknowledged = async {
            let mut pkid = None;
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::Sent(id) if pkid.is_none() => pkid = Some(id),
                    Delivery::Acked(id) if pkid == Some(id) => return Ok(()),
                    _ => {}
                }
            }
            Err(PublishError::ConnectionLost)
        };

        match tokio::time::timeout(self.publish_timeout, acknowledged).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        }
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.connected.load(Ordering::Relaxed))
    }

    async fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            if let Err(e) = session.client.disconnect().await {
                debug!("MQTT disconnect: {}", e);
            }
        }
        self.teardown();
        info!("Disconnected from MQTT broker");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_defaults_to_gateway() {
        let transport = MqttTransport::new(&PublishConfig::default(), "edge-gw");
        assert_eq!(transport.client_id, "gateway-edge-gw");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_publish_without_session() {
        let mut transport = MqttTransport::new(&PublishConfig::default(), "edge-gw");
        let result = transport.publish("vehicle/X/telemetry", vec![1]).await;
        assert!(matches!(result, Err(PublishError::NotConnected)));
    }
}
