//! Test doubles shared by the manager and scheduler tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::broker::{BrokerApi, CredentialPair};
use crate::error::{BrokerError, SourceError};
use crate::session::SessionState;
use crate::sources::CredentialSource;

/// In-process broker issuing numbered credentials.
pub(crate) struct FakeBroker {
    issued: AtomicUsize,
    redeems: AtomicUsize,
    exchanges: AtomicUsize,
    delay: Duration,
    access_ttl: Duration,
    redeem_failure: Mutex<Option<BrokerError>>,
    accepted_assertion: Option<String>,
    devices: Mutex<Vec<Option<String>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self {
            issued: AtomicUsize::new(0),
            redeems: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
            delay: Duration::ZERO,
            access_ttl: Duration::from_secs(3 * 3600),
            redeem_failure: Mutex::new(None),
            accepted_assertion: None,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Rejects every assertion except `assertion`.
    pub(crate) fn accepting_only(mut self, assertion: &str) -> Self {
        self.accepted_assertion = Some(assertion.to_string());
        self
    }

    pub(crate) fn fail_redeems_with(&self, error: BrokerError) {
        *self.redeem_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn redeems(&self) -> usize {
        self.redeems.load(Ordering::SeqCst)
    }

    pub(crate) fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub(crate) fn devices(&self) -> Vec<Option<String>> {
        self.devices.lock().unwrap().clone()
    }

    fn pair(&self) -> CredentialPair {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        CredentialPair {
            access_credential: format!("access-{n}"),
            refresh_credential: format!("refresh-{n}"),
            access_expiry: now + self.access_ttl.as_secs() as i64,
            refresh_expiry: now + 30 * 86400,
        }
    }
}

#[async_trait]
impl BrokerApi for FakeBroker {
    async fn exchange(
        &self,
        identity_assertion: &str,
        device_id: Option<&str>,
    ) -> Result<CredentialPair, BrokerError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.devices
            .lock()
            .unwrap()
            .push(device_id.map(str::to_string));
        if let Some(accepted) = &self.accepted_assertion
            && accepted != identity_assertion
        {
            return Err(BrokerError::Rejected {
                replay_suspected: false,
                message: "assertion signature verification failed".to_string(),
            });
        }
        Ok(self.pair())
    }

    async fn redeem(&self, _refresh_credential: &str) -> Result<CredentialPair, BrokerError> {
        self.redeems.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.redeem_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.pair())
    }
}

/// Source returning a fixed assertion, or nothing.
pub(crate) struct StaticSource {
    name: String,
    assertion: Option<String>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub(crate) fn new(name: &str, assertion: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            assertion: assertion.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(&self) -> Result<Option<String>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.assertion.clone())
    }
}

/// A stored session whose access credential expires `secs` from now.
pub(crate) fn session_expiring_in(secs: u64) -> SessionState {
    let now = OffsetDateTime::now_utc();
    SessionState {
        subject: Some("alice".to_string()),
        access_credential: "access-stored".to_string(),
        refresh_credential: "refresh-stored".to_string(),
        access_expiry: now + Duration::from_secs(secs),
        refresh_expiry: now + Duration::from_secs(30 * 86400),
    }
}
