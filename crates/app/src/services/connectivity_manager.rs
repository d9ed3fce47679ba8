//! Connectivity manager: provisioning, reachability monitoring and fallback.
//!
//! Owns the [`ConnectivitySession`] and is the only writer of the
//! connectivity state. Every transition is persisted to the
//! [`ConnectivityLog`] and published through the [`StateHolder`].
//!
//! Other loops talk to it through a [`ConnectivityHandle`]: the command
//! channel reports remote health, the diagnostics service asks for a reset.

use std::collections::VecDeque;
use std::time::Duration;

use sporekeeper_domain::connectivity::{
    ConnectivitySession, ConnectivityState, ConnectivityTransition, HISTORY_LIMIT,
};
use sporekeeper_domain::credentials::NetworkCredentials;
use sporekeeper_domain::error::SporeKeeperError;
use sporekeeper_domain::time::{Timestamp, now, span};
use tokio::sync::{mpsc, oneshot};

use crate::backoff::Backoff;
use crate::ports::{
    ConnectivityLog, HealthProbe, NetworkInterface, ProvisioningChannel, ProvisioningReply,
    ProvisioningRequest, SettingsStore,
};
use crate::shutdown::Shutdown;
use crate::state::StateHolder;

/// Reachability policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivitySettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub associate_timeout: Duration,
    /// Consecutive failed probes before `Connected -> Degraded`.
    pub degraded_after: u32,
    /// How long the primary network may stay unreachable before fallback.
    pub fallback_after: Duration,
    /// Connected/Degraded flips within this window count as flapping.
    pub flap_window: Duration,
    /// Flips within the window before the probe interval starts to back off.
    pub flap_threshold: usize,
    pub flap_backoff: Backoff,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            associate_timeout: Duration::from_secs(30),
            degraded_after: 3,
            fallback_after: Duration::from_secs(300),
            flap_window: Duration::from_secs(600),
            flap_threshold: 4,
            flap_backoff: Backoff::new(Duration::from_secs(15), Duration::from_secs(600)),
        }
    }
}

/// Requests from other loops.
#[derive(Debug)]
pub enum ConnectivityEvent {
    /// Forget the network and return to provisioning.
    Reset {
        reply: oneshot::Sender<Result<(), SporeKeeperError>>,
    },
    /// Remote-side liveness as seen by the command channel.
    RemoteHealth(bool),
}

/// Cloneable sender side of the manager's event inbox.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    sender: mpsc::Sender<ConnectivityEvent>,
}

impl ConnectivityHandle {
    /// Clear stored credentials and return to `Unprovisioned`.
    ///
    /// # Errors
    ///
    /// Fails if the credentials could not be cleared or the manager is gone.
    pub async fn reset(&self) -> Result<(), SporeKeeperError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ConnectivityEvent::Reset { reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// A handle whose events land in the returned receiver.
    ///
    /// Used to build a manager's inbox, or to observe events in isolation.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ConnectivityEvent>) {
        let (sender, events) = mpsc::channel(capacity);
        (Self { sender }, events)
    }

    /// Report remote health without waiting. Dropped if the inbox is full.
    pub fn report_remote_health(&self, healthy: bool) {
        if let Err(err) = self
            .sender
            .try_send(ConnectivityEvent::RemoteHealth(healthy))
        {
            tracing::debug!(%err, healthy, "remote health report dropped");
        }
    }
}

fn stopped() -> SporeKeeperError {
    SporeKeeperError::network(std::io::Error::other("connectivity manager stopped"))
}

/// The connectivity lifecycle loop.
pub struct ConnectivityManager<N, P, C, S, L> {
    network: N,
    probe: P,
    channel: C,
    store: S,
    log: L,
    state: StateHolder,
    settings: ConnectivitySettings,
    session: ConnectivitySession,
    credentials: Option<NetworkCredentials>,
    events: mpsc::Receiver<ConnectivityEvent>,
    requests_tx: mpsc::Sender<ProvisioningRequest>,
    requests: mpsc::Receiver<ProvisioningRequest>,
    channel_open: bool,
    probe_failures: u32,
    link_down_since: Option<Timestamp>,
    flaps: VecDeque<Timestamp>,
}

impl<N, P, C, S, L> ConnectivityManager<N, P, C, S, L>
where
    N: NetworkInterface,
    P: HealthProbe,
    C: ProvisioningChannel,
    S: SettingsStore,
    L: ConnectivityLog,
{
    pub fn new(
        network: N,
        probe: P,
        channel: C,
        store: S,
        log: L,
        state: StateHolder,
        settings: ConnectivitySettings,
    ) -> (Self, ConnectivityHandle) {
        let (handle, events) = ConnectivityHandle::channel(16);
        let (requests_tx, requests) = mpsc::channel(4);
        let manager = Self {
            network,
            probe,
            channel,
            store,
            log,
            state,
            settings,
            session: ConnectivitySession::start(false, now()),
            credentials: None,
            events,
            requests_tx,
            requests,
            channel_open: false,
            probe_failures: 0,
            link_down_since: None,
            flaps: VecDeque::new(),
        };
        (manager, handle)
    }

    #[must_use]
    pub fn session(&self) -> &ConnectivitySession {
        &self.session
    }

    /// Restore the session from the durable area and take the first step.
    ///
    /// # Errors
    ///
    /// Returns a storage error if stored credentials or history cannot be read.
    pub async fn start(&mut self, now: Timestamp) -> Result<(), SporeKeeperError> {
        self.credentials = self.store.credentials().await?;
        let history = self.log.recent(HISTORY_LIMIT).await?;
        self.session =
            ConnectivitySession::start(self.credentials.is_some(), now).with_history(history);
        self.publish();
        tracing::info!(
            state = %self.session.state(),
            channel = self.channel.kind(),
            "connectivity manager started"
        );

        match self.session.state() {
            ConnectivityState::Unprovisioned => self.enter_provisioning(now).await,
            _ => {
                if self.try_connect().await {
                    self.move_to(ConnectivityState::Connected, now, "associated at boot")
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        if let Err(err) = self.start(now()).await {
            tracing::error!(%err, "failed to restore connectivity session");
        }
        loop {
            let delay = self.probe_delay(now());
            tokio::select! {
                () = shutdown.wait() => break,
                Some(request) = self.requests.recv() => self.handle_provisioning(request, now()).await,
                Some(event) = self.events.recv() => self.handle_event(event, now()).await,
                () = tokio::time::sleep(delay) => self.probe_tick(now()).await,
            }
        }
        if self.channel_open {
            self.close_channel().await;
        }
        tracing::info!("connectivity manager stopped");
    }

    /// Judge a credential payload from the provisioning channel.
    pub async fn handle_provisioning(&mut self, request: ProvisioningRequest, now: Timestamp) {
        let ProvisioningRequest { payload, reply } = request;
        let state = self.session.state();
        if !state.serves_provisioning() {
            tracing::warn!(%state, "credentials received while not provisioning, ignored");
            let _ = reply.send(ProvisioningReply::Rejected(format!(
                "device is {state}, not accepting credentials"
            )));
            return;
        }

        let credentials = match payload.validate() {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(%err, "provisioning payload rejected");
                let _ = reply.send(ProvisioningReply::Rejected(err.to_string()));
                return;
            }
        };

        if let Err(err) = self.store.save_credentials(&credentials).await {
            tracing::error!(%err, "failed to persist network credentials");
            self.state.record_storage_failure();
            let _ = reply.send(ProvisioningReply::Rejected(
                "credentials could not be stored".to_string(),
            ));
            return;
        }
        self.state.record_storage_success();
        tracing::info!(ssid = %credentials.ssid, open = credentials.is_open(), "credentials stored");
        let _ = reply.send(ProvisioningReply::Accepted);

        self.credentials = Some(credentials);
        self.close_channel().await;
        self.move_to(ConnectivityState::Associating, now, "credentials received")
            .await;
        if self.try_connect().await {
            self.move_to(ConnectivityState::Connected, now, "associated and remote reachable")
                .await;
        }
    }

    pub async fn handle_event(&mut self, event: ConnectivityEvent, now: Timestamp) {
        match event {
            ConnectivityEvent::Reset { reply } => {
                let _ = reply.send(self.reset(now).await);
            }
            ConnectivityEvent::RemoteHealth(healthy) => {
                if healthy {
                    tracing::trace!("remote reported healthy");
                } else if self.session.state().is_online() {
                    self.probe_failed(now, "command channel heartbeat lost").await;
                }
            }
        }
    }

    /// One reachability step for the current state.
    pub async fn probe_tick(&mut self, now: Timestamp) {
        match self.session.state() {
            ConnectivityState::Unprovisioned | ConnectivityState::Provisioning => {
                if !self.channel_open {
                    self.open_channel().await;
                }
            }
            ConnectivityState::Associating => {
                if self.try_connect().await {
                    self.move_to(ConnectivityState::Connected, now, "associated and remote reachable")
                        .await;
                } else if now - self.session.since() > span(self.settings.fallback_after) {
                    self.enter_fallback(now, "association timed out").await;
                }
            }
            ConnectivityState::Connected | ConnectivityState::Degraded => {
                self.monitor(now).await;
            }
            ConnectivityState::Fallback => {
                if self.try_connect().await {
                    self.close_channel().await;
                    self.move_to(ConnectivityState::Connected, now, "primary network restored")
                        .await;
                }
            }
        }
    }

    async fn monitor(&mut self, now: Timestamp) {
        if !self.network.link_up().await {
            let down_since = *self.link_down_since.get_or_insert(now);
            if now - down_since > span(self.settings.fallback_after) {
                self.enter_fallback(now, "primary network unreachable").await;
                return;
            }
            if self.session.state() == ConnectivityState::Connected {
                self.move_to(ConnectivityState::Degraded, now, "link down").await;
            }
            // Background reassociation; success is confirmed by the next probe.
            self.associate().await;
            return;
        }
        self.link_down_since = None;

        match self.probe_remote().await {
            Ok(()) => {
                self.probe_failures = 0;
                if self.session.state() == ConnectivityState::Degraded {
                    self.move_to(ConnectivityState::Connected, now, "health probe recovered")
                        .await;
                }
            }
            Err(reason) => self.probe_failed(now, &reason).await,
        }
    }

    async fn probe_failed(&mut self, now: Timestamp, reason: &str) {
        self.probe_failures += 1;
        tracing::debug!(failures = self.probe_failures, %reason, "remote health check failed");
        if self.session.state() == ConnectivityState::Connected
            && self.probe_failures >= self.settings.degraded_after
        {
            let reason = format!("{reason} ({} consecutive failures)", self.probe_failures);
            self.move_to(ConnectivityState::Degraded, now, reason).await;
        }
    }

    /// Associate, then confirm with a health probe.
    async fn try_connect(&mut self) -> bool {
        if !self.associate().await {
            return false;
        }
        match self.probe_remote().await {
            Ok(()) => {
                self.probe_failures = 0;
                self.link_down_since = None;
                true
            }
            Err(reason) => {
                tracing::debug!(%reason, "associated but remote not reachable yet");
                false
            }
        }
    }

    async fn associate(&self) -> bool {
        let Some(credentials) = &self.credentials else {
            return false;
        };
        match tokio::time::timeout(
            self.settings.associate_timeout,
            self.network.associate(credentials),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(%err, ssid = %credentials.ssid, "association failed");
                false
            }
            Err(_) => {
                tracing::warn!(ssid = %credentials.ssid, "association timed out");
                false
            }
        }
    }

    async fn probe_remote(&self) -> Result<(), String> {
        match tokio::time::timeout(self.settings.probe_timeout, self.probe.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("health probe timed out".to_string()),
        }
    }

    async fn reset(&mut self, now: Timestamp) -> Result<(), SporeKeeperError> {
        self.store.clear_credentials().await?;
        self.credentials = None;
        if let Err(err) = self.network.disconnect().await {
            tracing::warn!(%err, "failed to leave network during reset");
        }
        if self.channel_open {
            self.close_channel().await;
        }
        let transition = self.session.reset(now);
        tracing::warn!("connectivity reset, credentials cleared");
        self.persist(transition).await;
        self.probe_failures = 0;
        self.link_down_since = None;
        self.flaps.clear();
        self.enter_provisioning(now).await;
        Ok(())
    }

    async fn enter_provisioning(&mut self, now: Timestamp) {
        self.move_to(ConnectivityState::Provisioning, now, "no stored credentials")
            .await;
        self.open_channel().await;
    }

    async fn enter_fallback(&mut self, now: Timestamp, reason: &str) {
        self.move_to(ConnectivityState::Fallback, now, reason).await;
        self.link_down_since = None;
        self.open_channel().await;
    }

    async fn open_channel(&mut self) {
        match self.channel.open(self.requests_tx.clone()).await {
            Ok(()) => {
                self.channel_open = true;
                tracing::info!(channel = self.channel.kind(), "local channel open");
            }
            Err(err) => {
                tracing::error!(%err, channel = self.channel.kind(), "failed to open local channel, will retry");
            }
        }
    }

    async fn close_channel(&mut self) {
        if let Err(err) = self.channel.close().await {
            tracing::warn!(%err, channel = self.channel.kind(), "failed to close local channel");
        }
        self.channel_open = false;
    }

    async fn move_to(&mut self, to: ConnectivityState, now: Timestamp, reason: impl Into<String>) {
        match self.session.transition(to, now, reason) {
            Ok(transition) => {
                let flapped = matches!(
                    (transition.from, transition.to),
                    (ConnectivityState::Connected, ConnectivityState::Degraded)
                        | (ConnectivityState::Degraded, ConnectivityState::Connected)
                );
                if flapped {
                    self.flaps.push_back(now);
                }
                self.persist(transition).await;
            }
            Err(err) => tracing::warn!(%err, "connectivity transition refused"),
        }
    }

    async fn persist(&self, transition: ConnectivityTransition) {
        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "connectivity changed"
        );
        match self.log.record(transition).await {
            Ok(()) => self.state.record_storage_success(),
            Err(err) => {
                tracing::error!(%err, "failed to persist connectivity transition");
                self.state.record_storage_failure();
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let state = self.session.state();
        let since = self.session.since();
        self.state.update(|s| {
            s.connectivity = state;
            s.connectivity_since = since;
        });
    }

    /// Probe interval, stretched while the link flaps between Connected and
    /// Degraded.
    pub fn probe_delay(&mut self, now: Timestamp) -> Duration {
        let window = span(self.settings.flap_window);
        while self.flaps.front().is_some_and(|at| now - *at > window) {
            self.flaps.pop_front();
        }
        let flaps = self.flaps.len();
        if flaps < self.settings.flap_threshold {
            return self.settings.probe_interval;
        }
        let excess = u32::try_from(flaps - self.settings.flap_threshold).unwrap_or(u32::MAX);
        let delay = self.settings.flap_backoff.delay(excess.saturating_add(1));
        tracing::debug!(flaps, delay_ms = delay.as_millis(), "link flapping, probe backing off");
        delay.max(self.settings.probe_interval)
    }
}
