//! MQTT side of the bridge: configuration, connection, event pump and publish sink.

use anyhow::{bail, Context, Result};
use ems_rs485_lib::command::{CommandIntake, PendingCommands};
use ems_rs485_lib::publisher::Sink;
use ems_rs485_lib::register::topic_prefix;
use ems_rs485_lib::shutdown::Shutdown;
use log::*;
use paho_mqtt as mqtt;
use serde::Deserialize;
use std::fs::File;
use std::time::Duration;

/// How long the event pump blocks before looking at the shutdown token.
const EVENT_POLL: Duration = Duration::from_secs(1);

const MQTT_APPENDIX_AVAILABILITY: &str = "availability";

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Id of the EMS, part of every topic.
    #[serde(default = "default_ems_id")]
    pub ems_id: String,
    /// Client id; a random one is generated if not set.
    pub client_id: Option<String>,
    /// Quality of service code to use
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

fn default_ems_id() -> String {
    String::from("0001")
}

fn default_qos() -> u8 {
    0
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(120)
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yml";

    pub fn load(path: &str) -> Result<Self> {
        debug!("Loading MQTT config file from {path:?}");
        let file =
            File::open(path).with_context(|| format!("Cannot open MQTT config file {path:?}"))?;
        let config: MqttConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse MQTT config file {path:?}"))?;
        if config.qos > 2 {
            bail!("Invalid MQTT QoS {} in {path:?}, expected 0, 1 or 2", config.qos);
        }
        Ok(config)
    }

    pub fn qos(&self) -> i32 {
        self.qos as i32
    }

    fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            format!("EMS_{}_Client_{:08x}", self.ems_id, rand::random::<u32>())
        })
    }

    fn availability_topic(&self) -> String {
        format!(
            "{}/{MQTT_APPENDIX_AVAILABILITY}",
            topic_prefix(&self.ems_id)
        )
    }
}

/// A connected MQTT client for one EMS.
pub struct Bridge {
    client: mqtt::Client,
    config: MqttConfig,
    intake: CommandIntake,
}

impl Bridge {
    /// Connects to the broker. The availability topic is set to "offline" as last will.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(&config.url)
            .client_id(config.client_id())
            .finalize();
        let mut client =
            mqtt::Client::new(create_opts).with_context(|| "Error creating mqtt client")?;
        client.set_timeout(Duration::from_secs(5));

        let will = mqtt::Message::new_retained(config.availability_topic(), "offline", config.qos());
        let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
        let mut conn_builder = conn_builder
            .keep_alive_interval(config.keep_alive)
            .clean_session(true)
            .will_message(will);
        if let Some(user_name) = &config.username {
            conn_builder = conn_builder.user_name(user_name.as_str());
        }
        if let Some(password) = &config.password {
            conn_builder = conn_builder.password(password.as_str());
        }
        let conn_opts = conn_builder.finalize();

        client
            .connect(conn_opts)
            .with_context(|| format!("Mqtt client unable to connect to {}", config.url))?;
        info!("Connected to MQTT broker {}", config.url);

        Ok(Self {
            client,
            config: config.clone(),
            intake: CommandIntake::new(config.ems_id.clone()),
        })
    }

    /// A sink publishing through this connection.
    pub fn sink(&self) -> MqttSink {
        MqttSink {
            client: self.client.clone(),
            qos: self.config.qos(),
        }
    }

    fn subscribe(&self) -> Result<()> {
        for topic in self.intake.topics() {
            self.client
                .subscribe(&topic, self.config.qos())
                .with_context(|| format!("Cannot subscribe to {topic}"))?;
            debug!("Subscribed to {topic}");
        }
        Ok(())
    }

    /// Receives commands until shutdown. Raises shutdown itself if the
    /// connection is lost and a single reconnect attempt fails.
    pub fn run_event_pump(&self, pending: &PendingCommands, shutdown: &Shutdown) -> Result<()> {
        let messages = self.client.start_consuming();
        if let Err(error) = self.subscribe() {
            shutdown.trigger();
            return Err(error);
        }

        while !shutdown.is_triggered() {
            match messages.recv_timeout(EVENT_POLL) {
                Ok(Some(message)) => {
                    let payload = message.payload_str();
                    debug!("Message received: {} - {payload}", message.topic());
                    self.intake.handle(pending, message.topic(), &payload);
                }
                Ok(None) => {
                    if self.client.is_connected() {
                        continue;
                    }
                    warn!("Unexpected disconnection. Trying to reconnect...");
                    if let Err(error) = self.reconnect() {
                        shutdown.trigger();
                        return Err(error);
                    }
                }
                Err(error) if error.is_timeout() => continue,
                Err(_) => {
                    shutdown.trigger();
                    bail!("MQTT message stream closed");
                }
            }
        }
        self.client.stop_consuming();
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        self.client
            .reconnect()
            .with_context(|| "MQTT reconnect failed")?;
        info!("Reconnected to MQTT broker {}", self.config.url);
        self.subscribe()?;
        self.go_online()
    }

    pub fn go_online(&self) -> Result<()> {
        let msg = mqtt::Message::new_retained(
            self.config.availability_topic(),
            "online",
            self.config.qos(),
        );
        self.client
            .publish(msg)
            .with_context(|| "Cannot publish mqtt message")
    }

    /// Marks the EMS offline and closes the connection.
    pub fn disconnect(self) -> Result<()> {
        if self.client.is_connected() {
            let msg = mqtt::Message::new_retained(
                self.config.availability_topic(),
                "offline",
                self.config.qos(),
            );
            self.client
                .publish(msg)
                .with_context(|| "Cannot publish mqtt message")?;
            self.client
                .disconnect(None)
                .with_context(|| "Error disconnect mqtt client")?;
        }
        Ok(())
    }
}

/// Publishes decoded facts as plain text messages.
pub struct MqttSink {
    client: mqtt::Client,
    qos: i32,
}

impl Sink for MqttSink {
    type Error = mqtt::Error;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error> {
        self.client
            .publish(mqtt::Message::new(topic, payload, self.qos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: MqttConfig = serde_yaml::from_str("url: tcp://localhost:1883").unwrap();
        assert_eq!(config.ems_id, "0001");
        assert_eq!(config.qos(), 0);
        assert_eq!(config.keep_alive, Duration::from_secs(120));
        assert_eq!(config.availability_topic(), "solar/ems/0001/availability");
        assert!(config.client_id().starts_with("EMS_0001_Client_"));
    }

    #[test]
    fn config_full() {
        let config: MqttConfig = serde_yaml::from_str(
            "url: tcp://192.168.178.123:1883\n\
             username: mqtt\n\
             password: secret\n\
             ems_id: \"0042\"\n\
             client_id: ems-bridge\n\
             qos: 1\n\
             keep_alive: 30s\n",
        )
        .unwrap();
        assert_eq!(config.username.as_deref(), Some("mqtt"));
        assert_eq!(config.ems_id, "0042");
        assert_eq!(config.client_id(), "ems-bridge");
        assert_eq!(config.qos(), 1);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
    }
}
