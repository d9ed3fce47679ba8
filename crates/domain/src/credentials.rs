//! Primary-network credentials delivered during provisioning.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Optional information about the controller that provisioned the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Raw provisioning payload as received from a provisioning channel.
///
/// Fields default to empty so that a payload missing the network name still
/// deserializes and is rejected by [`ProvisioningPayload::validate`] with a
/// precise error.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub controller: Option<ControllerInfo>,
}

impl fmt::Debug for ProvisioningPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningPayload")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .field("controller", &self.controller)
            .finish()
    }
}

impl ProvisioningPayload {
    /// Validate the payload as a whole; nothing is applied on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingNetworkName`],
    /// [`ValidationError::InvalidNetworkName`] or
    /// [`ValidationError::InvalidPassphrase`].
    pub fn validate(self) -> Result<NetworkCredentials, ValidationError> {
        if self.ssid.is_empty() {
            return Err(ValidationError::MissingNetworkName);
        }
        if self.ssid.len() > 32 || !is_printable_ascii(&self.ssid) {
            return Err(ValidationError::InvalidNetworkName);
        }
        if !self.passphrase.is_empty() && !(8..=64).contains(&self.passphrase.len()) {
            return Err(ValidationError::InvalidPassphrase);
        }
        Ok(NetworkCredentials {
            ssid: self.ssid,
            passphrase: self.passphrase,
            controller: self.controller,
        })
    }
}

/// Validated credentials for the primary network.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub passphrase: String,
    #[serde(default)]
    pub controller: Option<ControllerInfo>,
}

impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .field("controller", &self.controller)
            .finish()
    }
}

impl NetworkCredentials {
    /// Whether the network is open (no passphrase).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.passphrase.is_empty()
    }
}

fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(ssid: &str, passphrase: &str) -> ProvisioningPayload {
        ProvisioningPayload {
            ssid: ssid.to_string(),
            passphrase: passphrase.to_string(),
            controller: None,
        }
    }

    #[test]
    fn should_accept_wpa_network() {
        let creds = payload("GrowRoom", "spores4ever").validate().unwrap();
        assert_eq!(creds.ssid, "GrowRoom");
        assert!(!creds.is_open());
    }

    #[test]
    fn should_accept_open_network() {
        let creds = payload("GrowRoom", "").validate().unwrap();
        assert!(creds.is_open());
    }

    #[test]
    fn should_reject_payload_missing_network_name() {
        let parsed: ProvisioningPayload =
            serde_json::from_str(r#"{"passphrase":"spores4ever"}"#).unwrap();
        assert_eq!(parsed.validate(), Err(ValidationError::MissingNetworkName));
    }

    #[test]
    fn should_reject_overlong_or_non_printable_name() {
        assert_eq!(
            payload(&"x".repeat(33), "").validate(),
            Err(ValidationError::InvalidNetworkName)
        );
        assert_eq!(
            payload("grow\nroom", "").validate(),
            Err(ValidationError::InvalidNetworkName)
        );
    }

    #[test]
    fn should_reject_short_passphrase() {
        assert_eq!(
            payload("GrowRoom", "short").validate(),
            Err(ValidationError::InvalidPassphrase)
        );
    }

    #[test]
    fn should_redact_passphrase_in_debug_output() {
        let creds = payload("GrowRoom", "spores4ever").validate().unwrap();
        let text = format!("{creds:?}");
        assert!(!text.contains("spores4ever"));
    }
}
