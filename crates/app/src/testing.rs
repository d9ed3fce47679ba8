//! In-memory port fakes shared by the service test modules.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use sporekeeper_domain::actuator::{Actuator, ActuatorState};
use sporekeeper_domain::command::{ChannelMessage, Command, DeliveryState};
use sporekeeper_domain::connectivity::ConnectivityTransition;
use sporekeeper_domain::credentials::NetworkCredentials;
use sporekeeper_domain::error::{ActuatorFault, SensorFault, SporeKeeperError};
use sporekeeper_domain::id::CommandId;
use sporekeeper_domain::reading::Metric;
use sporekeeper_domain::sync::{EntityType, JournalEntry, SyncCounts, SyncRecord, SyncState};
use sporekeeper_domain::time::{Timestamp, now};
use tokio::sync::mpsc;

use crate::ports::{
    ActuatorDriver, ActuatorStateRepository, CommandLog, CommandTransport, ConnectivityLog,
    HealthProbe, IngestItem, IngestionClient, ItemOutcome, Journal, NetworkInterface,
    ProvisioningChannel, ProvisioningRequest, SettingsStore,
};

fn io_error(msg: &str) -> SporeKeeperError {
    SporeKeeperError::network(std::io::Error::other(msg.to_string()))
}

// ── Journal ────────────────────────────────────────────────────

#[derive(Default)]
struct JournalInner {
    entries: BTreeMap<(EntityType, i64), JournalEntry>,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<Mutex<JournalInner>>,
}

impl InMemoryJournal {
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    pub fn entries(&self, entity_type: EntityType) -> Vec<JournalEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.record.entity_type == entity_type)
            .cloned()
            .collect()
    }

    pub fn states(&self, entity_type: EntityType) -> Vec<SyncState> {
        self.entries(entity_type)
            .into_iter()
            .map(|e| e.record.state)
            .collect()
    }

    fn set_state(&self, entity_type: EntityType, sequences: &[i64], state: SyncState) {
        let mut inner = self.inner.lock().unwrap();
        for seq in sequences {
            if let Some(entry) = inner.entries.get_mut(&(entity_type, *seq)) {
                assert!(entry.record.state.can_transition_to(state));
                entry.record.state = state;
                entry.record.updated_at = now();
            }
        }
    }
}

impl Journal for InMemoryJournal {
    async fn append(
        &self,
        entity_type: EntityType,
        entity_id: String,
        recorded_at: Timestamp,
        payload: serde_json::Value,
    ) -> Result<SyncRecord, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(SporeKeeperError::storage(std::io::Error::other("disk full")));
        }
        let sequence = inner
            .entries
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, s)| *s)
            .max()
            .unwrap_or(0)
            + 1;
        let record = SyncRecord {
            entity_type,
            sequence,
            entity_id,
            state: SyncState::Pending,
            attempts: 0,
            last_error: None,
            recorded_at,
            updated_at: now(),
        };
        inner.entries.insert(
            (entity_type, sequence),
            JournalEntry {
                record: record.clone(),
                payload,
            },
        );
        Ok(record)
    }

    async fn pending_batch(
        &self,
        entity_type: EntityType,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        Ok(self
            .entries(entity_type)
            .into_iter()
            .filter(|e| e.record.state == SyncState::Pending)
            .take(limit)
            .collect())
    }

    async fn mark_in_flight(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> Result<(), SporeKeeperError> {
        self.set_state(entity_type, &sequences, SyncState::InFlight);
        Ok(())
    }

    async fn mark_acked(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
    ) -> Result<(), SporeKeeperError> {
        self.set_state(entity_type, &sequences, SyncState::Acked);
        Ok(())
    }

    async fn release(
        &self,
        entity_type: EntityType,
        sequences: Vec<i64>,
        error: String,
    ) -> Result<(), SporeKeeperError> {
        self.set_state(entity_type, &sequences, SyncState::Pending);
        let mut inner = self.inner.lock().unwrap();
        for seq in sequences {
            if let Some(entry) = inner.entries.get_mut(&(entity_type, seq)) {
                entry.record.last_error = Some(error.clone());
            }
        }
        Ok(())
    }

    async fn reject(
        &self,
        entity_type: EntityType,
        sequence: i64,
        error: String,
        max_attempts: u32,
    ) -> Result<SyncState, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&(entity_type, sequence))
            .ok_or_else(|| io_error("missing"))?;
        entry.record.attempts += 1;
        entry.record.last_error = Some(error);
        entry.record.state = if entry.record.attempts >= max_attempts {
            SyncState::DeadLetter
        } else {
            SyncState::Pending
        };
        entry.record.updated_at = now();
        Ok(entry.record.state)
    }

    async fn requeue_dead_letters(
        &self,
        entity_type: Option<EntityType>,
        idle_since: Option<Timestamp>,
    ) -> Result<u64, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for entry in inner.entries.values_mut() {
            let r = &mut entry.record;
            if r.state == SyncState::DeadLetter
                && entity_type.is_none_or(|t| t == r.entity_type)
                && idle_since.is_none_or(|at| r.updated_at <= at)
            {
                r.state = SyncState::Pending;
                r.attempts = 0;
                r.updated_at = now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .values()
            .filter(|e| e.record.state == SyncState::DeadLetter)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<BTreeMap<EntityType, SyncCounts>, SporeKeeperError> {
        let inner = self.inner.lock().unwrap();
        let mut out: BTreeMap<EntityType, SyncCounts> = BTreeMap::new();
        for entry in inner.entries.values() {
            let c = out.entry(entry.record.entity_type).or_default();
            match entry.record.state {
                SyncState::Pending => c.pending += 1,
                SyncState::InFlight => c.in_flight += 1,
                SyncState::Acked => c.acked += 1,
                SyncState::DeadLetter => c.dead_letter += 1,
            }
        }
        Ok(out)
    }

    async fn find_in_range(
        &self,
        entity_type: EntityType,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, SporeKeeperError> {
        Ok(self
            .entries(entity_type)
            .into_iter()
            .filter(|e| e.record.recorded_at >= from && e.record.recorded_at < to)
            .take(limit)
            .collect())
    }

    async fn recover_in_flight(&self) -> Result<u64, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for entry in inner.entries.values_mut() {
            if entry.record.state == SyncState::InFlight {
                entry.record.state = SyncState::Pending;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn prune_acked_before(&self, cutoff: Timestamp) -> Result<u64, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| !(e.record.state == SyncState::Acked && e.record.recorded_at < cutoff));
        Ok((before - inner.entries.len()) as u64)
    }

    async fn check_writable(&self) -> Result<(), SporeKeeperError> {
        if self.inner.lock().unwrap().fail_writes {
            return Err(SporeKeeperError::storage(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

// ── Durable state ──────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemoryActuatorRepo {
    store: Arc<Mutex<HashMap<Actuator, ActuatorState>>>,
}

impl InMemoryActuatorRepo {
    pub fn get(&self, actuator: Actuator) -> Option<ActuatorState> {
        self.store.lock().unwrap().get(&actuator).cloned()
    }
}

impl ActuatorStateRepository for InMemoryActuatorRepo {
    async fn load_all(&self) -> Result<Vec<ActuatorState>, SporeKeeperError> {
        Ok(self.store.lock().unwrap().values().cloned().collect())
    }

    async fn save(&self, state: ActuatorState) -> Result<(), SporeKeeperError> {
        self.store.lock().unwrap().insert(state.actuator, state);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySettings {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemorySettings {
    pub fn with_credentials(credentials: &NetworkCredentials) -> Self {
        let settings = Self::default();
        settings.store.lock().unwrap().insert(
            crate::ports::store::CREDENTIALS_KEY.to_string(),
            serde_json::to_string(credentials).unwrap(),
        );
        settings
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key).cloned()
    }
}

impl SettingsStore for InMemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SporeKeeperError> {
        Ok(self.raw(key))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SporeKeeperError> {
        self.store.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SporeKeeperError> {
        self.store.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryConnectivityLog {
    items: Arc<Mutex<Vec<ConnectivityTransition>>>,
}

impl InMemoryConnectivityLog {
    pub fn all(&self) -> Vec<ConnectivityTransition> {
        self.items.lock().unwrap().clone()
    }
}

impl ConnectivityLog for InMemoryConnectivityLog {
    async fn record(&self, transition: ConnectivityTransition) -> Result<(), SporeKeeperError> {
        self.items.lock().unwrap().push(transition);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ConnectivityTransition>, SporeKeeperError> {
        let items = self.items.lock().unwrap();
        let skip = items.len().saturating_sub(limit);
        Ok(items.iter().skip(skip).cloned().collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCommandLog {
    items: Arc<Mutex<Vec<Command>>>,
}

impl InMemoryCommandLog {
    pub fn all(&self) -> Vec<Command> {
        self.items.lock().unwrap().clone()
    }
}

impl CommandLog for InMemoryCommandLog {
    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Command>, SporeKeeperError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn insert(&self, command: Command) -> Result<bool, SporeKeeperError> {
        let mut items = self.items.lock().unwrap();
        if items
            .iter()
            .any(|c| c.idempotency_key == command.idempotency_key)
        {
            return Ok(false);
        }
        items.push(command);
        Ok(true)
    }

    async fn update_state(&self, id: CommandId, state: DeliveryState) -> Result<(), SporeKeeperError> {
        if let Some(c) = self.items.lock().unwrap().iter_mut().find(|c| c.id == id) {
            c.delivery_state = state;
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Command>, SporeKeeperError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

// ── Hardware ───────────────────────────────────────────────────

#[derive(Default)]
struct DriverInner {
    states: HashMap<Actuator, bool>,
    failures: HashMap<Actuator, u32>,
    writes: Vec<(Actuator, bool)>,
}

#[derive(Clone, Default)]
pub struct FakeDriver {
    inner: Arc<Mutex<DriverInner>>,
}

impl FakeDriver {
    pub fn state(&self, actuator: Actuator) -> Option<bool> {
        self.inner.lock().unwrap().states.get(&actuator).copied()
    }

    pub fn fail_next(&self, actuator: Actuator, times: u32) {
        self.inner.lock().unwrap().failures.insert(actuator, times);
    }

    /// Writes that changed the physical state, in order.
    pub fn changes(&self, actuator: Actuator) -> Vec<bool> {
        let inner = self.inner.lock().unwrap();
        let mut last = false;
        let mut out = Vec::new();
        for (a, on) in &inner.writes {
            if *a == actuator && *on != last {
                out.push(*on);
                last = *on;
            }
        }
        out
    }
}

impl ActuatorDriver for FakeDriver {
    async fn apply(&self, actuator: Actuator, on: bool) -> Result<(), SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(left) = inner.failures.get_mut(&actuator)
            && *left > 0
        {
            *left -= 1;
            return Err(ActuatorFault {
                actuator,
                target: on,
                reason: "relay did not respond".to_string(),
            }
            .into());
        }
        inner.states.insert(actuator, on);
        inner.writes.push((actuator, on));
        Ok(())
    }

    async fn read(&self, actuator: Actuator) -> Result<bool, SporeKeeperError> {
        Ok(self.state(actuator).unwrap_or(false))
    }
}

#[derive(Clone, Default)]
pub struct FakeSensors {
    values: Arc<Mutex<HashMap<Metric, Option<f64>>>>,
}

impl FakeSensors {
    pub fn set(&self, metric: Metric, value: Option<f64>) {
        self.values.lock().unwrap().insert(metric, value);
    }
}

impl crate::ports::SensorSource for FakeSensors {
    async fn sample(&self, metric: Metric) -> Result<f64, SporeKeeperError> {
        let value = self.values.lock().unwrap().get(&metric).copied().flatten();
        value.ok_or_else(|| {
            SensorFault::ReadFailed {
                metric,
                reason: "no sensor".to_string(),
            }
            .into()
        })
    }
}

// ── Remote ─────────────────────────────────────────────────────

#[derive(Default)]
struct IngestInner {
    /// Remote store, upserted by id.
    store: BTreeMap<String, serde_json::Value>,
    /// Arrival order of every accepted upsert, including retransmissions.
    received: Vec<String>,
    offline: bool,
    /// Store this many items of the next batch, then fail the request.
    cut_after: Option<usize>,
    reject_ids: Vec<String>,
    /// Entity types whose batches fail at the transport level.
    unreachable_types: Vec<EntityType>,
}

#[derive(Clone, Default)]
pub struct FakeIngestion {
    inner: Arc<Mutex<IngestInner>>,
}

impl FakeIngestion {
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    pub fn cut_next_batch_after(&self, n: usize) {
        self.inner.lock().unwrap().cut_after = Some(n);
    }

    pub fn fail_type(&self, entity_type: EntityType) {
        self.inner.lock().unwrap().unreachable_types.push(entity_type);
    }

    pub fn reject(&self, id: &str) {
        self.inner.lock().unwrap().reject_ids.push(id.to_string());
    }

    pub fn stored(&self) -> BTreeMap<String, serde_json::Value> {
        self.inner.lock().unwrap().store.clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.inner.lock().unwrap().received.clone()
    }
}

impl IngestionClient for FakeIngestion {
    async fn send_batch(
        &self,
        entity_type: EntityType,
        items: Vec<IngestItem>,
    ) -> Result<Vec<ItemOutcome>, SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(io_error("connection refused"));
        }
        if inner.unreachable_types.contains(&entity_type) {
            return Err(io_error("bad gateway"));
        }
        let cut = inner.cut_after.take();
        let mut outcomes = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            if cut.is_some_and(|n| i >= n) {
                return Err(io_error("connection reset mid-batch"));
            }
            if inner.reject_ids.contains(&item.id) {
                outcomes.push(ItemOutcome {
                    id: item.id,
                    accepted: false,
                    reason: Some("schema mismatch".to_string()),
                });
                continue;
            }
            inner.received.push(item.id.clone());
            inner.store.insert(item.id.clone(), item.payload);
            outcomes.push(ItemOutcome {
                id: item.id,
                accepted: true,
                reason: None,
            });
        }
        Ok(outcomes)
    }
}

// ── Network ────────────────────────────────────────────────────

#[derive(Default)]
struct NetworkInner {
    link: bool,
    associate_fails: bool,
    healthy: bool,
    associations: u32,
}

#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl FakeNetwork {
    pub fn reachable() -> Self {
        let net = Self::default();
        {
            let mut inner = net.inner.lock().unwrap();
            inner.healthy = true;
        }
        net
    }

    pub fn set_link(&self, up: bool) {
        self.inner.lock().unwrap().link = up;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.lock().unwrap().healthy = healthy;
    }

    pub fn set_associate_fails(&self, fails: bool) {
        self.inner.lock().unwrap().associate_fails = fails;
    }

    pub fn associations(&self) -> u32 {
        self.inner.lock().unwrap().associations
    }
}

impl NetworkInterface for FakeNetwork {
    async fn associate(&self, _credentials: &NetworkCredentials) -> Result<(), SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        inner.associations += 1;
        if inner.associate_fails {
            return Err(io_error("association timed out"));
        }
        inner.link = true;
        Ok(())
    }

    async fn link_up(&self) -> bool {
        self.inner.lock().unwrap().link
    }

    async fn disconnect(&self) -> Result<(), SporeKeeperError> {
        self.inner.lock().unwrap().link = false;
        Ok(())
    }
}

impl HealthProbe for FakeNetwork {
    async fn probe(&self) -> Result<(), SporeKeeperError> {
        let inner = self.inner.lock().unwrap();
        if inner.link && inner.healthy {
            Ok(())
        } else {
            Err(io_error("health probe failed"))
        }
    }
}

#[derive(Default)]
struct ProvisioningInner {
    sink: Option<mpsc::Sender<ProvisioningRequest>>,
    opened: u32,
    closed: u32,
}

#[derive(Clone, Default)]
pub struct FakeProvisioning {
    inner: Arc<Mutex<ProvisioningInner>>,
}

impl FakeProvisioning {
    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().sink.is_some()
    }

    pub fn sink(&self) -> Option<mpsc::Sender<ProvisioningRequest>> {
        self.inner.lock().unwrap().sink.clone()
    }

    pub fn opened(&self) -> u32 {
        self.inner.lock().unwrap().opened
    }

    pub fn closed(&self) -> u32 {
        self.inner.lock().unwrap().closed
    }
}

impl ProvisioningChannel for FakeProvisioning {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn open(&self, requests: mpsc::Sender<ProvisioningRequest>) -> Result<(), SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sink = Some(requests);
        inner.opened += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sink.take().is_some() {
            inner.closed += 1;
        }
        Ok(())
    }
}

// ── Command transport ──────────────────────────────────────────

#[derive(Default)]
struct TransportInner {
    inbound: VecDeque<Result<ChannelMessage, SporeKeeperError>>,
    sent: Vec<ChannelMessage>,
    connects: u32,
    refuse_connect: bool,
}

/// Scripted transport. `recv` pops scripted messages and otherwise waits.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<TransportInner>>,
    notify: Arc<tokio::sync::Notify>,
}

impl FakeTransport {
    pub fn push(&self, message: Result<ChannelMessage, SporeKeeperError>) {
        self.inner.lock().unwrap().inbound.push_back(message);
        self.notify.notify_one();
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().unwrap().connects
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_connect = refuse;
    }
}

impl CommandTransport for FakeTransport {
    async fn connect(&mut self) -> Result<(), SporeKeeperError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse_connect {
            return Err(io_error("broker unreachable"));
        }
        inner.connects += 1;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ChannelMessage, SporeKeeperError> {
        loop {
            let notified = self.notify.notified();
            let next = self.inner.lock().unwrap().inbound.pop_front();
            if let Some(next) = next {
                return next;
            }
            notified.await;
        }
    }

    async fn send(&mut self, message: ChannelMessage) -> Result<(), SporeKeeperError> {
        self.inner.lock().unwrap().sent.push(message);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SporeKeeperError> {
        Ok(())
    }
}
