//! [`CommandTransport`] over MQTT.
//!
//! rumqttc only moves bytes while its event loop is polled. [`recv`] is the
//! only place that polls after the handshake, so outbound publishes queued by
//! [`send`] are flushed while the channel waits for the next message.
//!
//! [`recv`]: CommandTransport::recv
//! [`send`]: CommandTransport::send

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};

use sporekeeper_app::ports::CommandTransport;
use sporekeeper_domain::command::ChannelMessage;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::id::DeviceId;

use crate::config::MqttConfig;
use crate::error::MqttError;
use crate::topics::Topics;

const REQUEST_CAPACITY: usize = 32;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// MQTT-backed command channel transport for one device.
pub struct MqttTransport {
    config: MqttConfig,
    device_id: DeviceId,
    topics: Topics,
    session: Option<Session>,
}

impl MqttTransport {
    #[must_use]
    pub fn new(config: MqttConfig, device_id: DeviceId) -> Self {
        let topics = Topics::new(&config.base_topic, &device_id);
        Self {
            config,
            device_id,
            topics,
            session: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = if self.config.client_id.is_empty() {
            self.device_id.as_str().to_string()
        } else {
            self.config.client_id.clone()
        };
        let mut options =
            MqttOptions::new(client_id, &self.config.broker_host, self.config.broker_port);
        options.set_keep_alive(Duration::from_secs(u64::from(self.config.keep_alive_secs)));
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            &self.topics.status,
            b"offline".to_vec(),
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        options
    }

    async fn announce(topics: &Topics, client: &AsyncClient) -> Result<(), MqttError> {
        client
            .subscribe(&topics.commands, QoS::AtLeastOnce)
            .await
            .map_err(MqttError::Client)?;
        client
            .publish(&topics.status, QoS::AtLeastOnce, true, b"online".to_vec())
            .await
            .map_err(MqttError::Client)
    }

    async fn handshake(eventloop: &mut EventLoop) -> Result<(), MqttError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(MqttError::Connection(err)),
            }
        }
    }
}

impl CommandTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), SporeKeeperError> {
        self.session = None;
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let timeout = Duration::from_secs(u64::from(self.config.connect_timeout_secs));
        tokio::time::timeout(timeout, Self::handshake(&mut eventloop))
            .await
            .map_err(|_| MqttError::ConnectTimeout)??;
        Self::announce(&self.topics, &client).await?;
        tracing::info!(
            broker = %self.config.broker_host,
            topic = %self.topics.commands,
            "command channel connected"
        );
        self.session = Some(Session { client, eventloop });
        Ok(())
    }

    async fn recv(&mut self) -> Result<ChannelMessage, SporeKeeperError> {
        loop {
            let session = self.session.as_mut().ok_or(MqttError::NotConnected)?;
            match session.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != self.topics.commands {
                        tracing::debug!(topic = %publish.topic, "ignoring publish on foreign topic");
                        continue;
                    }
                    return ChannelMessage::decode(&publish.payload)
                        .map_err(|fault| MqttError::Payload(fault).into());
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // rumqttc reconnected on its own; the broker may have lost
                    // the subscription.
                    let client = session.client.clone();
                    Self::announce(&self.topics, &client).await?;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.session = None;
                    return Err(MqttError::Disconnected.into());
                }
                Ok(_) => {}
                Err(err) => {
                    self.session = None;
                    return Err(MqttError::Connection(err).into());
                }
            }
        }
    }

    async fn send(&mut self, message: ChannelMessage) -> Result<(), SporeKeeperError> {
        let session = self.session.as_ref().ok_or(MqttError::NotConnected)?;
        let payload = message.encode().map_err(MqttError::Payload)?;
        session
            .client
            .publish(&self.topics.events, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(MqttError::Client)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SporeKeeperError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session
            .client
            .publish(&self.topics.status, QoS::AtLeastOnce, true, b"offline".to_vec())
            .await
            .map_err(MqttError::Client)?;
        session.client.disconnect().await.map_err(MqttError::Client)?;
        // Drive the loop until the DISCONNECT packet is written.
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match session.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::debug!("broker did not drain before disconnect");
        }
        tracing::info!("command channel disconnected");
        Ok(())
    }
}
