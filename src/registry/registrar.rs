//! Registration control loop.
//!
//! One task owns the host record for the whole registration. It writes the
//! shared service record, keeps the host's liveness record refreshed, applies
//! credential rotations coming from the [`CredentialWatcher`] and removes the
//! liveness record on shutdown. Host state is only ever touched from this
//! task, so a rotation is always visible to the next heartbeat.

use super::retry::{retry_until_success, RetryPolicy};
use super::watcher::CredentialWatcher;
use super::{
    host_key, prepare, service_key, Credentials, Host, Infos, RegistryError, HEARTBEAT_DURATION,
    HEARTBEAT_RETRY_DELAY,
};
use crate::store::Store;
use crate::HOSTNAME;
use std::collections::VecDeque;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Heartbeat = Pin<Box<dyn Future<Output = Result<u64, RegistryError>> + Send>>;

/// Rotations held for a caller that is not reading; the oldest go first.
pub const MAX_PENDING_CREDENTIALS: usize = 64;

/// Lifecycle of a registration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    /// Writing the service record and the first liveness record
    Initializing,
    /// Heartbeating and following credential rotations
    Active,
    /// Removing the liveness record and stopping the watcher
    Stopping,
    /// Terminal
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// TTL of the liveness record; it is refreshed every `ttl - 1s`.
    pub ttl: Duration,
    /// Policy for the one-off service record write.
    pub service_retry: RetryPolicy,
    /// Policy for liveness record writes.
    pub heartbeat_retry: RetryPolicy,
    /// Host name used when the caller leaves it empty.
    pub default_host_name: String,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            ttl: HEARTBEAT_DURATION,
            service_retry: RetryPolicy::forever(Duration::ZERO),
            heartbeat_retry: RetryPolicy::forever(HEARTBEAT_RETRY_DELAY),
            default_host_name: HOSTNAME.to_string(),
        }
    }
}

impl RegistrarConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        let margin = Duration::from_secs(1);
        if self.ttl > margin {
            self.ttl - margin
        } else {
            self.ttl / 2
        }
    }
}

/// Handle on a running registration.
pub struct Registration {
    /// Current credentials, once after the service is registered and again
    /// on every rotation.
    pub credentials: mpsc::Receiver<Credentials>,
    state: watch::Receiver<RegistrarState>,
}

impl Registration {
    pub async fn recv(&mut self) -> Option<Credentials> {
        self.credentials.recv().await
    }

    pub fn state(&self) -> RegistrarState {
        *self.state.borrow()
    }

    /// Wait until the liveness record is gone and the watcher has exited.
    pub async fn stopped(&mut self) {
        if self
            .state
            .wait_for(|state| *state == RegistrarState::Stopped)
            .await
            .is_err()
        {
            // sender gone: the registrar task has already ended
            debug!("Registrar task ended before reporting Stopped");
        }
    }
}

/// Register `host` as an instance of `service` and keep it registered until
/// `shutdown` receives a message or its sender is dropped.
pub fn register(
    store: Arc<dyn Store>,
    service: &str,
    host: Host,
    infos: Option<Infos>,
    shutdown: mpsc::Receiver<()>,
) -> Registration {
    register_with_config(store, service, host, infos, shutdown, RegistrarConfig::default())
}

pub fn register_with_config(
    store: Arc<dyn Store>,
    service: &str,
    mut host: Host,
    infos: Option<Infos>,
    shutdown: mpsc::Receiver<()>,
    config: RegistrarConfig,
) -> Registration {
    let infos = prepare(service, &mut host, infos, &config.default_host_name);

    let (credentials_tx, credentials_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(RegistrarState::Initializing);

    let registrar = Registrar {
        host_key: host_key(service, &host.name),
        service_key: service_key(service),
        service: service.to_string(),
        store,
        host,
        infos,
        config,
        credentials_tx,
        pending: VecDeque::new(),
        state_tx,
    };
    tokio::spawn(registrar.run(shutdown));

    Registration {
        credentials: credentials_rx,
        state: state_rx,
    }
}

struct Registrar {
    store: Arc<dyn Store>,
    service: String,
    host: Host,
    infos: Infos,
    host_key: String,
    service_key: String,
    config: RegistrarConfig,
    credentials_tx: mpsc::Sender<Credentials>,
    // credentials the caller has not taken yet
    pending: VecDeque<Credentials>,
    state_tx: watch::Sender<RegistrarState>,
}

impl Registrar {
    async fn run(mut self, mut shutdown: mpsc::Receiver<()>) {
        info!(service = %self.service, host = %self.host.name, "Registering host");

        let initialized = tokio::select! {
            _ = shutdown.recv() => None,
            result = self.initialize() => Some(result),
        };
        let cursor = match initialized {
            Some(Ok(cursor)) => cursor,
            Some(Err(e)) => {
                error!(service = %self.service, error = %e, "Registration abandoned");
                self.set_state(RegistrarState::Stopped);
                return;
            }
            None => {
                self.stop(None).await;
                return;
            }
        };

        let (watcher_tx, mut watcher_rx) = mpsc::channel(1);
        let cancel_token = CancellationToken::new();
        let watcher = CredentialWatcher::new(
            Arc::clone(&self.store),
            self.service_key.clone(),
            cursor,
            watcher_tx,
            cancel_token.clone(),
        )
        .spawn();

        self.set_state(RegistrarState::Active);

        let period = self.config.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beat: Option<Heartbeat> = None;
        let caller_tx = self.credentials_tx.clone();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                Some(credentials) = watcher_rx.recv() => {
                    self.rotate(credentials);
                    // a heartbeat still retrying must not keep writing the old credentials
                    if beat.is_some() {
                        beat = Some(self.heartbeat());
                    }
                }

                _ = ticker.tick(), if beat.is_none() => {
                    beat = Some(self.heartbeat());
                }

                result = async {
                    match beat.as_mut() {
                        Some(beat) => beat.await,
                        None => future::pending().await,
                    }
                }, if beat.is_some() => {
                    beat = None;
                    // next refresh is a full interval after this one landed
                    ticker.reset();
                    match result {
                        Ok(version) => debug!(key = %self.host_key, version, "Heartbeat"),
                        Err(e) => error!(key = %self.host_key, error = %e, "Heartbeat abandoned"),
                    }
                }

                permit = caller_tx.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(credentials) = self.pending.pop_front() {
                            permit.send(credentials);
                        }
                    }
                    Err(_) => {
                        debug!(service = %self.service, "Credentials receiver dropped");
                        self.pending.clear();
                    }
                },
            }
        }

        drop(beat);
        drop(ticker);
        drop(caller_tx);
        self.stop(Some((cancel_token, watcher))).await;
    }

    async fn initialize(&mut self) -> Result<u64, RegistryError> {
        let value = serde_json::to_vec(&self.infos)?;
        let endpoints = self.store.endpoints();
        let cursor = retry_until_success(self.config.service_retry, &self.service, &endpoints, || {
            self.store.write(&self.service_key, value.clone(), None)
        })
        .await?;
        info!(key = %self.service_key, cursor, "Registered service");

        self.publish(self.host.credentials());

        self.heartbeat().await?;
        info!(key = %self.host_key, ttl = ?self.config.ttl, "Registered host");

        Ok(cursor)
    }

    /// Write the liveness record with the current host state. The returned
    /// future owns everything it needs so the loop stays free while it retries.
    fn heartbeat(&self) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let key = self.host_key.clone();
        let service = self.service.clone();
        let policy = self.config.heartbeat_retry;
        let ttl = self.config.ttl;
        let value = serde_json::to_vec(&self.host);

        Box::pin(async move {
            let value = value?;
            let endpoints = store.endpoints();
            let version = retry_until_success(policy, &service, &endpoints, || {
                store.write(&key, value.clone(), Some(ttl))
            })
            .await?;
            Ok::<_, RegistryError>(version)
        })
    }

    fn rotate(&mut self, credentials: Credentials) {
        info!(service = %self.service, user = %credentials.user, "Credentials rotated");
        self.host.set_credentials(&credentials);
        self.infos.set_credentials(&credentials);
        self.publish(credentials);
    }

    fn publish(&mut self, credentials: Credentials) {
        if !self.pending.is_empty() {
            self.queue(credentials);
            return;
        }
        match self.credentials_tx.try_send(credentials) {
            Ok(()) => {}
            Err(TrySendError::Full(credentials)) => self.queue(credentials),
            Err(TrySendError::Closed(_)) => {
                debug!(service = %self.service, "Credentials receiver dropped");
            }
        }
    }

    fn queue(&mut self, credentials: Credentials) {
        if self.pending.len() >= MAX_PENDING_CREDENTIALS {
            self.pending.pop_front();
            warn!(
                service = %self.service,
                max = MAX_PENDING_CREDENTIALS,
                "Credentials receiver is not reading, dropping oldest rotation"
            );
        }
        self.pending.push_back(credentials);
    }

    async fn stop(&mut self, watcher: Option<(CancellationToken, JoinHandle<()>)>) {
        self.set_state(RegistrarState::Stopping);

        match self.store.delete(&self.host_key).await {
            Ok(()) => info!(key = %self.host_key, "Deregistered host"),
            Err(e) => warn!(
                key = %self.host_key,
                endpoints = ?self.store.endpoints(),
                "fail to remove key '{}': {}",
                self.host_key,
                e
            ),
        }

        if let Some((cancel_token, handle)) = watcher {
            cancel_token.cancel();
            if let Err(e) = handle.await {
                warn!(service = %self.service, error = %e, "Credential watcher task failed");
            }
        }

        self.set_state(RegistrarState::Stopped);
    }

    fn set_state(&self, state: RegistrarState) {
        debug!(service = %self.service, ?state, "Registrar state");
        self.state_tx.send_replace(state);
    }
}
