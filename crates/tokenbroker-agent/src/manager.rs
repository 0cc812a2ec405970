//! Client session state machine.
//!
//! `Unauthenticated -> Acquiring -> Authenticated -> Refreshing -> Authenticated`,
//! with a rejected refresh moving to `Expired` and from there back to
//! `Acquiring`. At most one redeem or acquisition runs at a time; callers that
//! queue behind it reuse its result when the session generation moved on
//! while they waited.
//!
//! Other agent processes may share the session file. Every redeem, acquisition
//! and removal runs under the store's cross-process lock and first re-reads the
//! file, so a pair rotated by another process is adopted instead of redeeming
//! the spent one.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, watch};

use crate::broker::{BrokerApi, CredentialPair, HttpBroker};
use crate::config::AgentConfig;
use crate::device;
use crate::error::{AgentError, BrokerError};
use crate::session::{SessionState, SessionStore};
use crate::sources::{self, CredentialSource};

/// Observable lifecycle state of the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No credential pair is held.
    Unauthenticated,
    /// A credential source is producing an assertion for the broker.
    Acquiring,
    /// A usable pair is held.
    Authenticated,
    /// The refresh credential is being redeemed.
    Refreshing,
    /// The broker rejected the refresh credential; the pair was dropped.
    Expired,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Acquiring => "acquiring",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Owns the client's credential pair and serialises every change to it.
///
/// Share it behind an `Arc` between foreground callers and a
/// [`RefreshScheduler`](crate::RefreshScheduler).
pub struct SessionManager {
    broker: Arc<dyn BrokerApi>,
    store: SessionStore,
    sources: Vec<Arc<dyn CredentialSource>>,
    lead_time: Duration,
    device_id: Option<String>,
    session: RwLock<Option<SessionState>>,
    /// Held for the duration of every redeem or acquisition.
    flight: Mutex<()>,
    /// Bumped whenever a new credential pair is adopted or the session is removed.
    generation: watch::Sender<u64>,
    status: watch::Sender<SessionStatus>,
}

impl SessionManager {
    /// Creates a manager over `store`, loading any session already persisted.
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        store: SessionStore,
        sources: Vec<Arc<dyn CredentialSource>>,
        lead_time: Duration,
    ) -> Self {
        let session = store.load();
        let initial = if session.is_some() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Unauthenticated
        };
        let (generation, _) = watch::channel(0);
        let (status, _) = watch::channel(initial);

        Self {
            broker,
            store,
            sources,
            lead_time,
            device_id: None,
            session: RwLock::new(session),
            flight: Mutex::new(()),
            generation,
            status,
        }
    }

    /// Sets the identifier sent with every assertion exchange.
    pub fn with_device_id(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }

    /// Wires the HTTP broker, the configured sources and the session file.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let broker = Arc::new(
            HttpBroker::new(&config.broker_url, config.retry.clone())
                .with_timeout(config.request_timeout),
        );
        let store = SessionStore::new(config.session_path()?);
        Ok(
            Self::new(broker, store, sources::from_config(config), config.lead_time)
                .with_device_id(device::device_id()),
        )
    }

    /// How long before access expiry a refresh is due.
    pub fn lead_time(&self) -> Duration {
        self.lead_time
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Snapshot of the pair held in memory.
    pub async fn session(&self) -> Option<SessionState> {
        self.session.read().await.clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status transition.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Counter bumped each time a pair is adopted or the session removed.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver notified on every generation bump.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Returns a usable access credential.
    ///
    /// Outside the lead-time window this never touches the network. Inside
    /// it, the caller waits for an in-flight refresh or starts one. If the
    /// broker is unreachable the current credential is returned for as long
    /// as it has not expired.
    pub async fn get_token(&self) -> Result<String, AgentError> {
        let observed = self.generation();
        let now = OffsetDateTime::now_utc();
        if let Some(state) = self.session().await
            && !state.needs_refresh(now, self.lead_time)
        {
            return Ok(state.access_credential);
        }

        match self.refresh_if_stale(observed).await {
            Ok(state) => Ok(state.access_credential),
            Err(AgentError::Broker(e)) if e.is_transient() => match self.session().await {
                Some(state) if !state.access_expired(OffsetDateTime::now_utc()) => {
                    tracing::warn!(error = %e, "refresh failed, using current access credential");
                    Ok(state.access_credential)
                }
                _ => Err(AgentError::Broker(e)),
            },
            Err(e) => Err(e),
        }
    }

    /// Refreshes now unless another caller already did so while this one
    /// waited for the in-flight slot.
    pub async fn force_refresh(&self) -> Result<SessionState, AgentError> {
        self.refresh_if_stale(self.generation()).await
    }

    /// Renews the session unless its generation has moved past `observed`,
    /// in which case the newer session is returned without a redeem.
    pub async fn refresh_if_stale(&self, observed: u64) -> Result<SessionState, AgentError> {
        let _flight = self.flight.lock().await;
        let _file = self.store.lock().await?;
        self.adopt_persisted().await;
        if self.generation() != observed
            && let Some(state) = self.session().await
        {
            tracing::debug!(observed, current = self.generation(), "reusing concurrent refresh");
            return Ok(state);
        }
        self.renew_locked().await
    }

    /// Performs a fresh login, ignoring any stored session.
    pub async fn install(&self) -> Result<SessionState, AgentError> {
        let _flight = self.flight.lock().await;
        let _file = self.store.lock().await?;
        self.acquire_locked().await
    }

    /// Deletes the stored session. Returns false if there was none.
    pub async fn uninstall(&self) -> Result<bool, AgentError> {
        let _flight = self.flight.lock().await;
        let _file = self.store.lock().await?;
        let existed = self.store.delete()?;
        *self.session.write().await = None;
        self.generation.send_modify(|g| *g += 1);
        self.status.send_replace(SessionStatus::Unauthenticated);
        Ok(existed)
    }

    /// Takes over a newer pair written by another process. Must hold the
    /// store lock. A persisted pair expiring before the in-memory one is a
    /// stale write and is ignored.
    async fn adopt_persisted(&self) {
        let Some(persisted) = self.store.load() else {
            return;
        };
        let mut session = self.session.write().await;
        let newer = match session.as_ref() {
            Some(current) => {
                persisted.refresh_credential != current.refresh_credential
                    && persisted.access_expiry >= current.access_expiry
            }
            None => true,
        };
        if !newer {
            return;
        }

        tracing::info!(
            subject = ?persisted.subject,
            access_expiry = %persisted.access_expiry,
            "adopting session rotated by another process"
        );
        *session = Some(persisted);
        drop(session);
        self.generation.send_modify(|g| *g += 1);
        self.status.send_replace(SessionStatus::Authenticated);
    }

    async fn renew_locked(&self) -> Result<SessionState, AgentError> {
        let now = OffsetDateTime::now_utc();
        let current = self.session().await;

        let current = match current {
            Some(current) if !current.refresh_expired(now) => current,
            Some(_) => {
                tracing::info!("refresh credential expired, acquiring a new session");
                self.discard().await;
                return self.acquire_locked().await;
            }
            None => return self.acquire_locked().await,
        };

        self.status.send_replace(SessionStatus::Refreshing);
        match self.broker.redeem(&current.refresh_credential).await {
            Ok(pair) => self.adopt(pair).await,
            Err(BrokerError::Rejected {
                replay_suspected,
                message,
            }) => {
                if replay_suspected {
                    tracing::error!(
                        subject = ?current.subject,
                        reason = %message,
                        "refresh credential reported as replayed, discarding session"
                    );
                } else {
                    tracing::warn!(
                        subject = ?current.subject,
                        reason = %message,
                        "refresh rejected, discarding session"
                    );
                }
                self.discard().await;
                self.acquire_locked().await
            }
            Err(e) => {
                self.status.send_replace(SessionStatus::Authenticated);
                Err(e.into())
            }
        }
    }

    async fn acquire_locked(&self) -> Result<SessionState, AgentError> {
        self.status.send_replace(SessionStatus::Acquiring);
        let mut failures = Vec::new();

        for source in &self.sources {
            let assertion = match source.try_acquire().await {
                Ok(Some(assertion)) => assertion,
                Ok(None) => {
                    tracing::debug!(source = source.name(), "credential source not available");
                    failures.push(format!("{}: not available", source.name()));
                    continue;
                }
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "credential source failed");
                    failures.push(format!("{}: {e}", source.name()));
                    continue;
                }
            };

            match self
                .broker
                .exchange(&assertion, self.device_id.as_deref())
                .await
            {
                Ok(pair) => {
                    tracing::info!(source = source.name(), "session acquired");
                    return self.adopt(pair).await;
                }
                Err(e @ BrokerError::Rejected { .. }) => {
                    tracing::warn!(source = source.name(), error = %e, "assertion rejected by broker");
                    failures.push(format!("{}: {e}", source.name()));
                }
                Err(e) => {
                    self.status.send_replace(SessionStatus::Unauthenticated);
                    return Err(e.into());
                }
            }
        }

        self.status.send_replace(SessionStatus::Unauthenticated);
        if failures.is_empty() {
            failures.push("no credential sources configured".to_string());
        }
        Err(AgentError::acquisition_failed(failures.join("; ")))
    }

    async fn adopt(&self, pair: CredentialPair) -> Result<SessionState, AgentError> {
        let state = SessionState::from_pair(pair)?;
        if let Err(e) = self.store.save(&state) {
            // The pair stays usable in memory; the old refresh credential is spent.
            tracing::error!(error = %e, "failed to persist session");
        }
        *self.session.write().await = Some(state.clone());
        self.generation.send_modify(|g| *g += 1);
        self.status.send_replace(SessionStatus::Authenticated);
        tracing::info!(
            subject = ?state.subject,
            access_expiry = %state.access_expiry,
            "session updated"
        );
        Ok(state)
    }

    async fn discard(&self) {
        if let Err(e) = self.store.delete() {
            tracing::warn!(error = %e, "failed to delete session file");
        }
        *self.session.write().await = None;
        self.status.send_replace(SessionStatus::Expired);
    }
}
