//! Durable state ports: actuator states, the key-value settings area, the
//! connectivity transition log and the command log.

use std::future::Future;

use sporekeeper_domain::actuator::ActuatorState;
use sporekeeper_domain::command::{Command, DeliveryState};
use sporekeeper_domain::connectivity::ConnectivityTransition;
use sporekeeper_domain::credentials::NetworkCredentials;
use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};
use sporekeeper_domain::id::CommandId;
use sporekeeper_domain::phase::Phase;

/// Long-lived actuator state, one row per actuator, updated in place.
pub trait ActuatorStateRepository: Send + Sync {
    /// All persisted actuator states.
    fn load_all(&self) -> impl Future<Output = Result<Vec<ActuatorState>, SporeKeeperError>> + Send;

    /// Insert or overwrite the state of one actuator.
    fn save(&self, state: ActuatorState) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;
}

/// Small durable key-value area for settings that survive restarts.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, SporeKeeperError>> + Send;

    fn put(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Stored primary-network credentials, if provisioned.
    fn credentials(
        &self,
    ) -> impl Future<Output = Result<Option<NetworkCredentials>, SporeKeeperError>> + Send {
        async move {
            match self.get(CREDENTIALS_KEY).await? {
                Some(raw) => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|err| ProtocolFault::Malformed(err.to_string()).into()),
                None => Ok(None),
            }
        }
    }

    /// Persist credentials, replacing any previous ones.
    fn save_credentials(
        &self,
        credentials: &NetworkCredentials,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send {
        let encoded = serde_json::to_string(credentials).map_err(SporeKeeperError::storage);
        async move { self.put(CREDENTIALS_KEY, encoded?).await }
    }

    fn clear_credentials(&self) -> impl Future<Output = Result<(), SporeKeeperError>> + Send {
        self.delete(CREDENTIALS_KEY)
    }

    /// Persisted active phase, if one was ever selected.
    fn phase(&self) -> impl Future<Output = Result<Option<Phase>, SporeKeeperError>> + Send {
        async move {
            match self.get(PHASE_KEY).await? {
                Some(raw) => Ok(Some(raw.parse()?)),
                None => Ok(None),
            }
        }
    }

    fn save_phase(&self, phase: Phase) -> impl Future<Output = Result<(), SporeKeeperError>> + Send {
        self.put(PHASE_KEY, phase.as_str().to_string())
    }
}

/// Key holding the JSON-encoded [`NetworkCredentials`].
pub const CREDENTIALS_KEY: &str = "network.credentials";

/// Key holding the active [`Phase`].
pub const PHASE_KEY: &str = "control.phase";

/// Append-only history of connectivity transitions.
pub trait ConnectivityLog: Send + Sync {
    fn record(
        &self,
        transition: ConnectivityTransition,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Most recent transitions, returned oldest first.
    fn recent(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConnectivityTransition>, SporeKeeperError>> + Send;
}

/// Persisted record of received commands, unique by idempotency key.
pub trait CommandLog: Send + Sync {
    fn find_by_key(
        &self,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<Option<Command>, SporeKeeperError>> + Send;

    /// Store a new command. Returns `false` if its key was already stored.
    fn insert(&self, command: Command) -> impl Future<Output = Result<bool, SporeKeeperError>> + Send;

    fn update_state(
        &self,
        id: CommandId,
        state: DeliveryState,
    ) -> impl Future<Output = Result<(), SporeKeeperError>> + Send;

    /// Most recent commands, newest first.
    fn recent(&self, limit: usize) -> impl Future<Output = Result<Vec<Command>, SporeKeeperError>> + Send;
}
