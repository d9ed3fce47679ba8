//! Command channel: remote commands in, acknowledgements and heartbeats out.
//!
//! The loop connects only while the device is online and reconnects with its
//! own backoff. Each inbound command carries an idempotency key; a bounded
//! in-memory cache backed by the durable [`CommandLog`] discards redelivered
//! keys, so a command has at most one effect no matter how often the broker
//! replays it.
//!
//! The controller's answer is awaited off the session loop. Once it arrives
//! the log is updated and the final acknowledgement goes out. A command that
//! never reached the controller is logged `dropped`, and a later redelivery of
//! its key is queued again instead of being discarded as a duplicate.
//!
//! Heartbeats go out on a fixed interval. When too many in a row stay
//! unacknowledged the session is dropped, a reconnect begins and the
//! connectivity manager is told the remote side looks unhealthy.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use sporekeeper_domain::actuator::ControlSource;
use sporekeeper_domain::command::{ChannelMessage, Command, CommandKind, DeliveryState};
use sporekeeper_domain::error::{ProtocolFault, SporeKeeperError};
use sporekeeper_domain::id::CommandId;
use sporekeeper_domain::time::{Timestamp, now};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};

use crate::backoff::Backoff;
use crate::ports::{CommandLog, CommandTransport};
use crate::queue::{CommandOutcome, ControlInput, ControlQueue, QueuedCommand};
use crate::services::connectivity_manager::ConnectivityHandle;
use crate::shutdown::Shutdown;
use crate::state::StateHolder;

/// Channel liveness and delivery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub heartbeat_interval: Duration,
    /// Unacknowledged heartbeats in a row before the session is dropped.
    pub heartbeat_miss_limit: u32,
    pub reconnect: Backoff,
    /// How long to wait for the controller to apply a command before acking.
    pub ack_timeout: Duration,
    /// Idempotency keys remembered in memory.
    pub recent_capacity: usize,
    /// How often to re-check connectivity while offline.
    pub offline_poll: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_limit: 3,
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(120)),
            ack_timeout: Duration::from_secs(10),
            recent_capacity: 256,
            offline_poll: Duration::from_secs(5),
        }
    }
}

/// Bounded FIFO set of recently seen idempotency keys.
#[derive(Debug)]
struct RecentCommands {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl RecentCommands {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: &str) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.keys.remove(&evicted);
        }
    }
}

/// A queued command's answer, or the fact that it has not come yet.
#[derive(Debug)]
enum Awaited {
    Settled {
        command: Command,
        reason: Option<String>,
    },
    StillQueued {
        command: Command,
        reply: oneshot::Receiver<CommandOutcome>,
    },
}

/// Wait for the controller, then record the outcome durably. Gives the
/// receiver back if `limit` elapses first.
async fn await_outcome<L: CommandLog>(
    log: L,
    mut command: Command,
    mut reply: oneshot::Receiver<CommandOutcome>,
    limit: Option<Duration>,
) -> Awaited {
    let answer = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut reply).await {
            Ok(answer) => answer,
            Err(_) => return Awaited::StillQueued { command, reply },
        },
        None => reply.await,
    };
    let outcome =
        answer.unwrap_or_else(|_| CommandOutcome::dropped("dropped from full control queue"));
    command.delivery_state = outcome.state;
    if let Err(err) = log.update_state(command.id, outcome.state).await {
        tracing::error!(%err, id = %command.id, "failed to record command outcome");
    }
    Awaited::Settled {
        command,
        reason: outcome.reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

/// The remote command loop.
pub struct CommandChannel<T, L> {
    transport: T,
    log: L,
    queue: ControlQueue,
    connectivity: ConnectivityHandle,
    state: StateHolder,
    settings: ChannelSettings,
    recent: RecentCommands,
    heartbeat_seq: u64,
    unacked: u32,
    awaiting: JoinSet<Awaited>,
}

impl<T, L> CommandChannel<T, L>
where
    T: CommandTransport,
    L: CommandLog + Clone + 'static,
{
    pub fn new(
        transport: T,
        log: L,
        queue: ControlQueue,
        connectivity: ConnectivityHandle,
        state: StateHolder,
        settings: ChannelSettings,
    ) -> Self {
        let recent = RecentCommands::new(settings.recent_capacity);
        Self {
            transport,
            log,
            queue,
            connectivity,
            state,
            settings,
            recent,
            heartbeat_seq: 0,
            unacked: 0,
            awaiting: JoinSet::new(),
        }
    }

    /// Connect, serve and reconnect until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        tracing::info!("command channel started");
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_triggered() {
                break;
            }
            if !self.state.connectivity().is_online() {
                if sleep_or_shutdown(&mut shutdown, self.settings.offline_poll).await {
                    break;
                }
                continue;
            }

            if let Err(err) = self.transport.connect().await {
                let delay = self.settings.reconnect.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(%err, attempt, retry_in_ms = delay.as_millis(), "command channel connect failed");
                if sleep_or_shutdown(&mut shutdown, delay).await {
                    break;
                }
                continue;
            }
            attempt = 0;
            tracing::info!("command channel connected");
            self.state.update(|s| s.channel.connected = true);

            let end = self.session(&mut shutdown).await;

            if let Err(err) = self.transport.disconnect().await {
                tracing::debug!(%err, "command channel disconnect failed");
            }
            self.state.update(|s| s.channel.connected = false);
            if end == SessionEnd::Shutdown {
                break;
            }

            let delay = self.settings.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(retry_in_ms = delay.as_millis(), "command channel lost, reconnecting");
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        self.finish_awaiting().await;
        tracing::info!("command channel stopped");
    }

    /// Give queued commands one ack timeout to record their outcome. Their
    /// acknowledgements are not sent; the remote side redelivers instead.
    async fn finish_awaiting(&mut self) {
        let awaiting = &mut self.awaiting;
        let drained = tokio::time::timeout(self.settings.ack_timeout, async {
            while awaiting.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = self.awaiting.len(), "commands still unanswered at shutdown");
        }
    }

    async fn session(&mut self, shutdown: &mut Shutdown) -> SessionEnd {
        self.unacked = 0;
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.wait() => return SessionEnd::Shutdown,
                message = self.transport.recv() => match message {
                    Ok(message) => {
                        if let Err(err) = self.handle_message(message, now()).await {
                            tracing::warn!(%err, "command channel send failed");
                            return SessionEnd::Lost;
                        }
                    }
                    Err(SporeKeeperError::Protocol(fault)) => {
                        tracing::warn!(%fault, "discarding malformed channel message");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "command channel receive failed");
                        return SessionEnd::Lost;
                    }
                },
                Some(joined) = self.awaiting.join_next() => {
                    if let Err(err) = self.on_awaited(joined).await {
                        tracing::warn!(%err, "command ack send failed");
                        return SessionEnd::Lost;
                    }
                }
                _ = heartbeat.tick() => {
                    if self.unacked >= self.settings.heartbeat_miss_limit {
                        tracing::warn!(missed = self.unacked, "heartbeat acks missing, reconnecting");
                        self.connectivity.report_remote_health(false);
                        return SessionEnd::Lost;
                    }
                    if let Err(err) = self.send_heartbeat().await {
                        tracing::warn!(%err, "heartbeat send failed");
                        return SessionEnd::Lost;
                    }
                }
            }
            if !self.state.connectivity().is_online() {
                tracing::info!("device went offline, closing command channel");
                return SessionEnd::Lost;
            }
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), SporeKeeperError> {
        self.heartbeat_seq += 1;
        self.unacked += 1;
        self.transport
            .send(ChannelMessage::Heartbeat {
                seq: self.heartbeat_seq,
                sent_at: now(),
            })
            .await
    }

    /// Handle one inbound message.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the reply could not be sent.
    pub async fn handle_message(
        &mut self,
        message: ChannelMessage,
        now: Timestamp,
    ) -> Result<(), SporeKeeperError> {
        match message {
            ChannelMessage::Command {
                id,
                idempotency_key,
                command,
            } => self.handle_command(id, idempotency_key, command, now).await,
            ChannelMessage::HeartbeatAck { seq } => {
                tracing::trace!(seq, "heartbeat acknowledged");
                self.unacked = 0;
                self.state.update(|s| s.channel.last_heartbeat_ack = Some(now));
                self.connectivity.report_remote_health(true);
                Ok(())
            }
            other => {
                let fault = ProtocolFault::UnexpectedMessage(other.type_name().to_string());
                tracing::warn!(%fault, "ignoring outbound-only message type");
                Ok(())
            }
        }
    }

    /// Wait for every queued command to be answered and acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the transport error if an acknowledgement could not be sent.
    pub async fn flush(&mut self) -> Result<(), SporeKeeperError> {
        while let Some(joined) = self.awaiting.join_next().await {
            self.on_awaited(joined).await?;
        }
        Ok(())
    }

    /// Handle the next controller answer, waiting for it if needed. Returns
    /// `false` if nothing was waiting.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the acknowledgement could not be sent.
    pub async fn settle_next(&mut self) -> Result<bool, SporeKeeperError> {
        match self.awaiting.join_next().await {
            Some(joined) => self.on_awaited(joined).await.map(|()| true),
            None => Ok(false),
        }
    }

    async fn on_awaited(
        &mut self,
        joined: Result<Awaited, JoinError>,
    ) -> Result<(), SporeKeeperError> {
        match joined {
            Ok(Awaited::Settled { command, reason }) => {
                tracing::info!(id = %command.id, state = %command.delivery_state, "command settled");
                self.transport
                    .send(ChannelMessage::ack(&command, reason))
                    .await
            }
            Ok(Awaited::StillQueued { command, reply }) => {
                tracing::info!(id = %command.id, "command still queued, acknowledging receipt");
                let ack = ChannelMessage::ack(&command, Some("still queued".to_string()));
                self.awaiting
                    .spawn(await_outcome(self.log.clone(), command, reply, None));
                self.transport.send(ack).await
            }
            Err(err) => {
                tracing::error!(%err, "command waiter failed");
                Ok(())
            }
        }
    }

    async fn handle_command(
        &mut self,
        id: CommandId,
        key: String,
        kind: CommandKind,
        now: Timestamp,
    ) -> Result<(), SporeKeeperError> {
        match self.previous_delivery(&key).await {
            Some(Previously::Logged(previous))
                if previous.delivery_state == DeliveryState::Dropped =>
            {
                return self.redeliver(previous).await;
            }
            Some(Previously::Logged(previous)) => {
                return self.discard_duplicate(id, key, previous.delivery_state).await;
            }
            Some(Previously::Seen) => {
                return self
                    .discard_duplicate(id, key, DeliveryState::Received)
                    .await;
            }
            None => {}
        }

        let command = match Command::received(id, key.clone(), kind.clone(), now) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(%err, %id, "rejecting invalid command");
                let rejected = Command {
                    id,
                    idempotency_key: key,
                    kind,
                    received_at: now,
                    delivery_state: DeliveryState::Rejected,
                };
                self.remember(&rejected).await;
                return self
                    .transport
                    .send(ChannelMessage::ack(&rejected, Some(err.to_string())))
                    .await;
            }
        };

        if !self.remember(&command).await {
            // Another delivery of the same key won the insert.
            return self
                .discard_duplicate(id, key, DeliveryState::Received)
                .await;
        }

        tracing::info!(%id, key = %command.idempotency_key, command = command.kind.name(), "command received");
        self.dispatch(command).await
    }

    /// Queue a command that an earlier delivery lost, under its logged id.
    async fn redeliver(&mut self, mut command: Command) -> Result<(), SporeKeeperError> {
        tracing::info!(id = %command.id, key = %command.idempotency_key, "redelivered command was dropped before, queueing again");
        command.delivery_state = DeliveryState::Received;
        if let Err(err) = self.log.update_state(command.id, DeliveryState::Received).await {
            tracing::error!(%err, id = %command.id, "failed to record command redelivery");
        }
        self.recent.insert(&command.idempotency_key);
        self.dispatch(command).await
    }

    /// Where an earlier command with the same key got to, if anywhere.
    async fn previous_delivery(&mut self, key: &str) -> Option<Previously> {
        match self.log.find_by_key(key).await {
            Ok(Some(previous)) => return Some(Previously::Logged(previous)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%err, "command log lookup failed, relying on memory cache");
            }
        }
        self.recent.contains(key).then_some(Previously::Seen)
    }

    async fn discard_duplicate(
        &mut self,
        id: CommandId,
        key: String,
        previous: DeliveryState,
    ) -> Result<(), SporeKeeperError> {
        tracing::info!(%id, %key, previous = previous.as_str(), "duplicate command discarded");
        self.recent.insert(&key);
        self.state.update(|s| s.channel.duplicates_discarded += 1);
        let ack = ChannelMessage::CommandAck {
            id,
            idempotency_key: key,
            status: DeliveryState::Duplicate,
            reason: Some(format!("already {}", previous.as_str())),
        };
        self.transport.send(ack).await
    }

    /// Record the key durably and in memory. Returns `false` when the log
    /// already held it.
    async fn remember(&mut self, command: &Command) -> bool {
        self.recent.insert(&command.idempotency_key);
        match self.log.insert(command.clone()).await {
            Ok(inserted) => {
                self.state.record_storage_success();
                inserted
            }
            Err(err) => {
                tracing::error!(%err, id = %command.id, "failed to persist command");
                self.state.record_storage_failure();
                true
            }
        }
    }

    /// Hand the command to its consumer. Control commands are acknowledged
    /// once the controller answers, without holding up the session.
    async fn dispatch(&mut self, mut command: Command) -> Result<(), SporeKeeperError> {
        if command.kind == CommandKind::ResetConnectivity {
            let outcome = match self.connectivity.reset().await {
                Ok(()) => CommandOutcome::applied(),
                Err(err) => CommandOutcome::rejected(err.to_string()),
            };
            return self.settle_now(&mut command, outcome).await;
        }

        let (reply, rx) = oneshot::channel();
        let queued = self.queue.push(ControlInput::Command(QueuedCommand {
            command: command.clone(),
            source: ControlSource::RemoteOverride,
            reply: Some(reply),
        }));
        if !queued {
            let outcome = CommandOutcome::dropped("controller is shutting down");
            return self.settle_now(&mut command, outcome).await;
        }
        self.awaiting.spawn(await_outcome(
            self.log.clone(),
            command,
            rx,
            Some(self.settings.ack_timeout),
        ));
        Ok(())
    }

    async fn settle_now(
        &mut self,
        command: &mut Command,
        outcome: CommandOutcome,
    ) -> Result<(), SporeKeeperError> {
        command.delivery_state = outcome.state;
        if let Err(err) = self.log.update_state(command.id, outcome.state).await {
            tracing::error!(%err, id = %command.id, "failed to record command outcome");
        }
        self.transport
            .send(ChannelMessage::ack(command, outcome.reason))
            .await
    }
}

/// An earlier delivery of the same idempotency key.
#[derive(Debug)]
enum Previously {
    Logged(Command),
    /// Only in the memory cache, e.g. because the log write failed.
    Seen,
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(shutdown: &mut Shutdown, delay: Duration) -> bool {
    tokio::select! {
        () = shutdown.wait() => true,
        () = tokio::time::sleep(delay) => false,
    }
}
