//! Port definitions: traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the outside world.
//! They are defined here (in `app`) so that both the use-case layer and the
//! adapter layer can depend on them without creating circular dependencies.

pub mod hardware;
pub mod journal;
pub mod network;
pub mod remote;
pub mod store;

pub use hardware::{ActuatorDriver, SensorSource};
pub use journal::Journal;
pub use network::{
    AccessPoint, HealthProbe, NetworkInterface, ProvisioningChannel, ProvisioningReply,
    ProvisioningRequest,
};
pub use remote::{CommandTransport, IngestItem, IngestionClient, ItemOutcome};
pub use store::{ActuatorStateRepository, CommandLog, ConnectivityLog, SettingsStore};
