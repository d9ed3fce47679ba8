//! Topic layout for one device.

use sporekeeper_domain::id::DeviceId;

/// The three topics a device uses under `{base}/{device}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub commands: String,
    pub events: String,
    pub status: String,
}

impl Topics {
    #[must_use]
    pub fn new(base: &str, device: &DeviceId) -> Self {
        let root = format!("{}/{}", base.trim_end_matches('/'), device.as_str());
        Self {
            commands: format!("{root}/commands"),
            events: format!("{root}/events"),
            status: format!("{root}/status"),
        }
    }
}
