//! MQTT command channel configuration.

use serde::Deserialize;

/// Configuration for the MQTT command channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address.
    pub broker_host: String,
    /// MQTT broker port.
    pub broker_port: u16,
    /// MQTT client identifier. Defaults to the device id when empty.
    pub client_id: String,
    /// Base topic prefix for all sporekeeper MQTT communication.
    pub base_topic: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// How long to wait for the broker's `CONNACK`, in seconds.
    pub connect_timeout_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: String::new(),
            base_topic: "sporekeeper".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            username: None,
            password: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_have_sensible_defaults() {
        let config = MqttConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert!(config.client_id.is_empty());
        assert_eq!(config.base_topic, "sporekeeper");
        assert_eq!(config.keep_alive_secs, 30);
        assert!(config.username.is_none());
    }

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            broker_host = "mqtt.example.com"
            broker_port = 8883
            client_id = "chamber-01"
            base_topic = "farm"
            keep_alive_secs = 60
            username = "chamber-01"
            password = "secret"
        "#;
        let config: MqttConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_host, "mqtt.example.com");
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.client_id, "chamber-01");
        assert_eq!(config.base_topic, "farm");
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.password.as_deref(), Some("secret"));
    }

    #[test]
    fn should_use_defaults_for_missing_fields() {
        let toml = r#"broker_host = "192.168.1.100""#;
        let config: MqttConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_host, "192.168.1.100");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.connect_timeout_secs, 10);
    }
}
