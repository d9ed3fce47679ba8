//! Virtual primary network and soft access point.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use sporekeeper_app::ports::{AccessPoint, HealthProbe, NetworkInterface};
use sporekeeper_domain::credentials::NetworkCredentials;
use sporekeeper_domain::error::SporeKeeperError;

use crate::lock;

fn unreachable(reason: &str) -> SporeKeeperError {
    SporeKeeperError::network(std::io::Error::other(reason.to_string()))
}

#[derive(Debug)]
struct Link {
    /// Networks in range; `None` means any SSID associates.
    in_range: Option<BTreeSet<String>>,
    joined: Option<String>,
    carrier: bool,
    remote_reachable: bool,
}

/// A network interface whose link and remote reachability are set by hand.
///
/// Clones share the same link.
#[derive(Debug, Clone)]
pub struct VirtualNetwork {
    link: Arc<Mutex<Link>>,
}

impl Default for VirtualNetwork {
    fn default() -> Self {
        Self {
            link: Arc::new(Mutex::new(Link {
                in_range: None,
                joined: None,
                carrier: true,
                remote_reachable: true,
            })),
        }
    }
}

impl VirtualNetwork {
    /// Only the listed SSIDs can be joined.
    #[must_use]
    pub fn with_networks<I, S>(self, ssids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.link).in_range = Some(ssids.into_iter().map(Into::into).collect());
        self
    }

    /// Simulate losing or regaining the radio link.
    pub fn set_carrier(&self, up: bool) {
        lock(&self.link).carrier = up;
    }

    /// Simulate the remote service going away or coming back.
    pub fn set_remote_reachable(&self, reachable: bool) {
        lock(&self.link).remote_reachable = reachable;
    }

    #[must_use]
    pub fn joined(&self) -> Option<String> {
        lock(&self.link).joined.clone()
    }
}

impl NetworkInterface for VirtualNetwork {
    async fn associate(&self, credentials: &NetworkCredentials) -> Result<(), SporeKeeperError> {
        let mut link = lock(&self.link);
        if !link.carrier {
            return Err(unreachable("no carrier"));
        }
        if let Some(in_range) = &link.in_range
            && !in_range.contains(&credentials.ssid)
        {
            return Err(unreachable("network not in range"));
        }
        link.joined = Some(credentials.ssid.clone());
        tracing::debug!(ssid = %credentials.ssid, "virtual network joined");
        Ok(())
    }

    async fn link_up(&self) -> bool {
        let link = lock(&self.link);
        link.carrier && link.joined.is_some()
    }

    async fn disconnect(&self) -> Result<(), SporeKeeperError> {
        lock(&self.link).joined = None;
        Ok(())
    }
}

impl HealthProbe for VirtualNetwork {
    async fn probe(&self) -> Result<(), SporeKeeperError> {
        let link = lock(&self.link);
        if !link.carrier || link.joined.is_none() {
            return Err(unreachable("link down"));
        }
        if !link.remote_reachable {
            return Err(unreachable("remote unreachable"));
        }
        Ok(())
    }
}

/// A soft access point that only remembers what it broadcasts.
#[derive(Debug, Clone, Default)]
pub struct VirtualAccessPoint {
    broadcasting: Arc<Mutex<Option<String>>>,
}

impl VirtualAccessPoint {
    #[must_use]
    pub fn broadcasting(&self) -> Option<String> {
        lock(&self.broadcasting).clone()
    }
}

impl AccessPoint for VirtualAccessPoint {
    async fn start(&self, ssid: &str) -> Result<(), SporeKeeperError> {
        *lock(&self.broadcasting) = Some(ssid.to_string());
        tracing::debug!(ssid, "virtual access point up");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SporeKeeperError> {
        *lock(&self.broadcasting) = None;
        Ok(())
    }
}
