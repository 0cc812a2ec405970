//! Persisted client session.
//!
//! The session file is replaced atomically: a temporary file in the same
//! directory is written, synced and renamed over the old one, so readers see
//! either the previous or the new session and never a partial write.
//!
//! Every agent process sharing a session path serialises its
//! load/redeem/save sequence on [`SessionStore::lock`], an exclusive advisory
//! lock on a sibling `<session>.lock` file.

use std::ffi::OsString;
use std::fs::{self, File, TryLockError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::broker::CredentialPair;
use crate::error::AgentError;

/// The credential pair held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Subject the pair was issued to, when the access credential reveals it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub access_credential: String,
    pub refresh_credential: String,
    /// When the broker stops accepting `access_credential`.
    #[serde(with = "time::serde::rfc3339")]
    pub access_expiry: OffsetDateTime,
    /// When `refresh_credential` can no longer be redeemed.
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_expiry: OffsetDateTime,
}

impl SessionState {
    /// Builds the state for a pair returned by the broker. Fails only when an
    /// expiry is outside the representable range.
    pub fn from_pair(pair: CredentialPair) -> Result<Self, AgentError> {
        let access_expiry = OffsetDateTime::from_unix_timestamp(pair.access_expiry)
            .map_err(|e| AgentError::session(format!("invalid access expiry: {e}")))?;
        let refresh_expiry = OffsetDateTime::from_unix_timestamp(pair.refresh_expiry)
            .map_err(|e| AgentError::session(format!("invalid refresh expiry: {e}")))?;
        Ok(Self {
            subject: peek_subject(&pair.access_credential),
            access_credential: pair.access_credential,
            refresh_credential: pair.refresh_credential,
            access_expiry,
            refresh_expiry,
        })
    }

    /// Instant at which the access credential should be renewed.
    pub fn refresh_at(&self, lead_time: Duration) -> OffsetDateTime {
        self.access_expiry - lead_time
    }

    /// True once `now` has reached the lead-time window.
    pub fn needs_refresh(&self, now: OffsetDateTime, lead_time: Duration) -> bool {
        now >= self.refresh_at(lead_time)
    }

    /// Time left until the lead-time window opens, zero if already open.
    pub fn refresh_delay(&self, now: OffsetDateTime, lead_time: Duration) -> Duration {
        Duration::try_from(self.refresh_at(lead_time) - now).unwrap_or(Duration::ZERO)
    }

    /// True once the access credential can no longer be presented.
    pub fn access_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.access_expiry
    }

    /// True once the broker would refuse to redeem the refresh credential.
    pub fn refresh_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.refresh_expiry
    }
}

/// Reads `sub` from a JWT payload without verifying it. Display only.
fn peek_subject(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}

/// File-backed session storage.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store backed by the file at `path`. Nothing is touched until used.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Path of the lock file guarding this session.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Takes the cross-process session lock, waiting while another agent
    /// process holds it. The lock is released when the guard is dropped.
    pub async fn lock(&self) -> Result<SessionLock, AgentError> {
        create_private_dir(self.dir())?;
        let path = self.lock_path();
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AgentError::session(format!("{}: {e}", path.display())))?;

        match file.try_lock() {
            Ok(()) => return Ok(SessionLock { _file: file }),
            Err(TryLockError::WouldBlock) => {}
            Err(TryLockError::Error(e)) => {
                return Err(AgentError::session(format!("lock {}: {e}", path.display())));
            }
        }

        tracing::debug!(path = %path.display(), "waiting for another agent process");
        tokio::task::spawn_blocking(move || {
            file.lock()
                .map(|()| SessionLock { _file: file })
                .map_err(|e| AgentError::session(format!("lock {}: {e}", path.display())))
        })
        .await
        .map_err(|e| AgentError::session(format!("session lock task failed: {e}")))?
    }

    /// Loads the stored session. Missing, unreadable and corrupt files all
    /// yield `None`; the latter two are logged.
    pub fn load(&self) -> Option<SessionState> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "session file unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "session file corrupt, ignoring");
                None
            }
        }
    }

    /// Atomically replaces the stored session.
    pub fn save(&self, state: &SessionState) -> Result<(), AgentError> {
        let dir = self.dir();
        create_private_dir(dir)?;

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| AgentError::session(format!("serialize session: {e}")))?;

        // NamedTempFile is created with mode 0600 on Unix
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| AgentError::session(format!("{}: {e}", dir.display())))?;
        tmp.write_all(&content)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| AgentError::session(format!("write session: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| AgentError::session(format!("{}: {}", self.path.display(), e.error)))?;

        tracing::debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    /// Removes the stored session. Returns false if there was none.
    pub fn delete(&self) -> Result<bool, AgentError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::session(format!("{}: {e}", self.path.display()))),
        }
    }
}

/// Held while an agent process owns the session file.
#[derive(Debug)]
pub struct SessionLock {
    _file: File,
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<(), AgentError> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| AgentError::session(format!("{}: {e}", dir.display())))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<(), AgentError> {
    fs::create_dir_all(dir).map_err(|e| AgentError::session(format!("{}: {e}", dir.display())))
}
