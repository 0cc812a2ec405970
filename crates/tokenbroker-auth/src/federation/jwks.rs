//! Identity provider key-set caching.
//!
//! Assertions from the external identity provider are verified against the
//! provider's published JSON Web Key Set. This module keeps one cached key set
//! per issuer and decides when to go back to the network.
//!
//! # Overview
//!
//! - [`KeySetCache`] - Per-issuer cache with TTL, single-flight refetch and a
//!   bounded stale-serving window
//! - [`KeySetFetcher`] - Network boundary; [`HttpKeySetFetcher`] resolves the
//!   key-set location through OIDC discovery
//! - [`KeySet`] - The verification keys of one successful fetch
//!
//! # Refetch policy
//!
//! A lookup refetches iff the cached set is at least `ttl` old. Concurrent
//! callers that observe a stale entry queue behind a per-issuer guard and the
//! first one fetches; the rest reuse its result. When the provider cannot be
//! reached, a stale set keeps being served (with a warning) until it is
//! `stale_ceiling` old, after which lookups fail closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use url::Url;

use super::discovery::{DiscoveryError, OidcDiscoveryClient};
use crate::config::KeySetConfig;

/// After a failed fetch, concurrent callers reuse the stale set for this long
/// instead of each retrying the provider.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Source of raw key sets for an issuer.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetches the current key set published by `issuer`.
    async fn fetch(&self, issuer: &Url) -> Result<JwkSet, DiscoveryError>;
}

/// Fetches key sets over HTTP, locating them through OIDC discovery.
pub struct HttpKeySetFetcher {
    client: OidcDiscoveryClient,
}

impl HttpKeySetFetcher {
    /// Creates a fetcher with the timeouts and limits of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &KeySetConfig) -> Result<Self, DiscoveryError> {
        Ok(Self {
            client: OidcDiscoveryClient::new(config)?,
        })
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, issuer: &Url) -> Result<JwkSet, DiscoveryError> {
        self.client.discover_key_set(issuer).await
    }
}

/// A single verification key.
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id (`kid`), if published.
    pub kid: Option<String>,
    /// Algorithm bound to the key (`alg`), if published.
    pub algorithm: Option<Algorithm>,
    /// Key material.
    pub key: DecodingKey,
}

impl VerificationKey {
    /// Returns `true` if the key may verify a signature made with `alg`.
    #[must_use]
    pub fn permits(&self, alg: Algorithm) -> bool {
        self.algorithm.is_none_or(|a| a == alg)
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Signing keys obtained from one successful fetch.
#[derive(Debug)]
pub struct KeySet {
    keys: Vec<VerificationKey>,
    fetched_at: Instant,
    generation: u64,
}

impl KeySet {
    fn from_jwk_set(jwks: &JwkSet, generation: u64) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter(|k| matches!(&k.common.public_key_use, None | Some(PublicKeyUse::Signature)))
            .filter_map(|jwk| match DecodingKey::from_jwk(jwk) {
                Ok(key) => Some(VerificationKey {
                    kid: jwk.common.key_id.clone(),
                    algorithm: jwk_algorithm(jwk),
                    key,
                }),
                Err(e) => {
                    tracing::debug!(kid = ?jwk.common.key_id, "Skipping unusable JWK: {}", e);
                    None
                }
            })
            .collect();

        Self {
            keys,
            fetched_at: Instant::now(),
            generation,
        }
    }

    /// Looks up a key by `kid`.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    /// All signing keys in the set.
    #[must_use]
    pub fn keys(&self) -> &[VerificationKey] {
        &self.keys
    }

    /// Number of signing keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the set has no usable signing keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// When the set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Time elapsed since the fetch.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Monotonic fetch counter; differs between any two fetches.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct IssuerSlot {
    current: RwLock<Option<Arc<KeySet>>>,
    /// Held for the duration of a fetch. Records the last failed attempt.
    fetch_guard: Mutex<Option<Instant>>,
}

impl IssuerSlot {
    fn new() -> Self {
        Self {
            current: RwLock::new(None),
            fetch_guard: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Refetch {
    /// Fetch only if the cached set is older than the TTL.
    IfStale,
    /// Fetch unless the set observed by the caller was already replaced.
    Replace { seen_generation: u64 },
}

/// Process-wide cache of identity provider key sets, keyed by issuer.
pub struct KeySetCache {
    fetcher: Arc<dyn KeySetFetcher>,
    slots: RwLock<HashMap<String, Arc<IssuerSlot>>>,
    ttl: Duration,
    stale_ceiling: Duration,
    forced_refetch_cooldown: Duration,
    generation: AtomicU64,
}

impl KeySetCache {
    /// Creates a cache over an arbitrary fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, config: &KeySetConfig) -> Self {
        Self {
            fetcher,
            slots: RwLock::new(HashMap::new()),
            ttl: config.ttl,
            stale_ceiling: config.stale_ceiling,
            forced_refetch_cooldown: config.forced_refetch_cooldown,
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a cache backed by [`HttpKeySetFetcher`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_http(config: &KeySetConfig) -> Result<Self, DiscoveryError> {
        let fetcher = HttpKeySetFetcher::new(config)?;
        Ok(Self::new(Arc::new(fetcher), config))
    }

    /// Returns the verification keys of `issuer`.
    ///
    /// A live cache entry is returned without network access.
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be fetched and no cached copy within
    /// the stale ceiling exists.
    pub async fn get_keys(&self, issuer: &Url) -> Result<Arc<KeySet>, DiscoveryError> {
        let slot = self.slot(issuer).await;

        if let Some(keys) = slot.current.read().await.as_ref()
            && keys.age() < self.ttl
        {
            tracing::trace!("Cache hit for key set of {}", issuer);
            return Ok(Arc::clone(keys));
        }

        self.refetch(&slot, issuer, Refetch::IfStale).await
    }

    /// Refetches the key set of `issuer` because `seen` lacked a needed key.
    ///
    /// If another caller already replaced `seen`, the newer set is returned
    /// without a fetch. Sets younger than the forced-refetch cooldown are
    /// returned as they are.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_keys`].
    pub async fn force_refetch(
        &self,
        issuer: &Url,
        seen: &KeySet,
    ) -> Result<Arc<KeySet>, DiscoveryError> {
        let slot = self.slot(issuer).await;
        self.refetch(
            &slot,
            issuer,
            Refetch::Replace {
                seen_generation: seen.generation,
            },
        )
        .await
    }

    async fn refetch(
        &self,
        slot: &IssuerSlot,
        issuer: &Url,
        mode: Refetch,
    ) -> Result<Arc<KeySet>, DiscoveryError> {
        let mut last_failure = slot.fetch_guard.lock().await;
        let current = slot.current.read().await.clone();

        if let Some(keys) = &current {
            match mode {
                Refetch::IfStale if keys.age() < self.ttl => {
                    tracing::trace!("Key set of {} refreshed by a concurrent caller", issuer);
                    return Ok(Arc::clone(keys));
                }
                Refetch::Replace { seen_generation } if keys.generation != seen_generation => {
                    return Ok(Arc::clone(keys));
                }
                Refetch::Replace { .. } if keys.age() < self.forced_refetch_cooldown => {
                    tracing::debug!(
                        "Forced refetch for {} suppressed, key set is {:?} old",
                        issuer,
                        keys.age()
                    );
                    return Ok(Arc::clone(keys));
                }
                _ => {}
            }

            if let Some(failed_at) = *last_failure
                && failed_at.elapsed() < FAILURE_BACKOFF
                && keys.age() < self.stale_ceiling
            {
                return Ok(Arc::clone(keys));
            }
        }

        tracing::debug!("Refetching key set for {}", issuer);
        match self.fetcher.fetch(issuer).await {
            Ok(jwks) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let keys = Arc::new(KeySet::from_jwk_set(&jwks, generation));
                if keys.is_empty() {
                    tracing::warn!("Key set for {} contains no usable signing keys", issuer);
                }
                tracing::info!(
                    issuer = %issuer,
                    keys = keys.len(),
                    generation,
                    "Cached identity provider key set"
                );
                *slot.current.write().await = Some(Arc::clone(&keys));
                *last_failure = None;
                Ok(keys)
            }
            Err(e) => {
                *last_failure = Some(Instant::now());
                match current {
                    Some(keys) if keys.age() < self.stale_ceiling => {
                        tracing::warn!(
                            issuer = %issuer,
                            age_secs = keys.age().as_secs(),
                            "Key set refetch failed, serving stale copy: {}",
                            e
                        );
                        Ok(keys)
                    }
                    Some(keys) => {
                        tracing::error!(
                            issuer = %issuer,
                            age_secs = keys.age().as_secs(),
                            "Key set refetch failed and cached copy is past the stale ceiling: {}",
                            e
                        );
                        Err(DiscoveryError::StaleCeilingExceeded {
                            issuer: issuer.to_string(),
                            age_secs: keys.age().as_secs(),
                        })
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn slot(&self, issuer: &Url) -> Arc<IssuerSlot> {
        let key = normalize_issuer_key(issuer);

        if let Some(slot) = self.slots.read().await.get(&key) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(key)
                .or_insert_with(|| Arc::new(IssuerSlot::new())),
        )
    }

    /// Drops the cached key set of `issuer`; the next lookup fetches.
    pub async fn invalidate(&self, issuer: &Url) {
        let slot = self.slots.read().await.get(&normalize_issuer_key(issuer)).cloned();
        if let Some(slot) = slot {
            *slot.current.write().await = None;
            tracing::debug!("Invalidated key set cache for {}", issuer);
        }
    }

    /// Clears all entries from the cache.
    pub async fn clear(&self) {
        self.slots.write().await.clear();
        tracing::debug!("Cleared all key set cache entries");
    }

    /// Returns the number of issuers with a cached key set.
    pub async fn len(&self) -> usize {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.current.read().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Returns `true` if no issuer has a cached key set.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Normalizes an issuer URL for use as a cache key.
fn normalize_issuer_key(issuer: &Url) -> String {
    issuer.as_str().trim_end_matches('/').to_string()
}

/// Extracts the algorithm from a JWK.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;

    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticFetcher, TestIdp};
    use futures_util::future::join_all;

    fn issuer() -> Url {
        Url::parse("https://login.example.com/tenant/v2.0").unwrap()
    }

    fn config(ttl: Duration, stale_ceiling: Duration) -> KeySetConfig {
        KeySetConfig {
            ttl,
            stale_ceiling,
            forced_refetch_cooldown: Duration::ZERO,
            ..KeySetConfig::default()
        }
    }

    fn cache_with(fetcher: &Arc<StaticFetcher>, config: &KeySetConfig) -> KeySetCache {
        KeySetCache::new(Arc::clone(fetcher) as Arc<dyn KeySetFetcher>, config)
    }

    #[tokio::test]
    async fn test_lookups_within_ttl_fetch_once() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let cache = cache_with(&fetcher, &config(Duration::from_secs(60), Duration::from_secs(600)));

        let first = cache.get_keys(&issuer()).await.unwrap();
        let second = cache.get_keys(&issuer()).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(first.generation(), second.generation());
        assert!(first.find("key-1").is_some());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_lookups_share_one_fetch() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(
            StaticFetcher::new(idp.jwk_set()).with_delay(Duration::from_millis(100)),
        );
        let cache = cache_with(&fetcher, &config(Duration::from_secs(60), Duration::from_secs(600)));

        let issuer = issuer();
        let results = join_all((0..16).map(|_| cache.get_keys(&issuer))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetched_once_under_concurrency() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(
            StaticFetcher::new(idp.jwk_set()).with_delay(Duration::from_millis(50)),
        );
        let cache = cache_with(
            &fetcher,
            &config(Duration::from_millis(100), Duration::from_secs(600)),
        );
        let issuer = issuer();

        let before = cache.get_keys(&issuer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let results = join_all((0..8).map(|_| cache.get_keys(&issuer))).await;
        assert_eq!(fetcher.calls(), 2);
        for result in results {
            assert_ne!(result.unwrap().generation(), before.generation());
        }
    }

    #[tokio::test]
    async fn test_stale_entry_served_when_provider_down() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let cache = cache_with(
            &fetcher,
            &config(Duration::from_millis(50), Duration::from_secs(600)),
        );

        let before = cache.get_keys(&issuer()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        fetcher.set_failing(true);

        let after = cache.get_keys(&issuer()).await.unwrap();
        assert_eq!(after.generation(), before.generation());
        assert_eq!(fetcher.calls(), 2);

        // Within the failure backoff no further fetch is attempted
        let again = cache.get_keys(&issuer()).await.unwrap();
        assert_eq!(again.generation(), before.generation());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_fails_closed_past_stale_ceiling() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let cache = cache_with(
            &fetcher,
            &config(Duration::from_millis(30), Duration::from_millis(60)),
        );

        cache.get_keys(&issuer()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fetcher.set_failing(true);

        let err = cache.get_keys(&issuer()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::StaleCeilingExceeded { .. }));
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        fetcher.set_failing(true);
        let cache = cache_with(&fetcher, &KeySetConfig::default());

        let err = cache.get_keys(&issuer()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NetworkError(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_forced_refetch_picks_up_rotated_key() {
        let old = TestIdp::new("old-key");
        let new = TestIdp::new("new-key");
        let fetcher = Arc::new(StaticFetcher::new(old.jwk_set()));
        let cache = cache_with(&fetcher, &config(Duration::from_secs(60), Duration::from_secs(600)));

        let seen = cache.get_keys(&issuer()).await.unwrap();
        assert!(seen.find("new-key").is_none());

        fetcher.set_jwk_set(new.jwk_set());
        let rotated = cache.force_refetch(&issuer(), &seen).await.unwrap();
        assert!(rotated.find("new-key").is_some());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_forced_refetches_coalesce() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(
            StaticFetcher::new(idp.jwk_set()).with_delay(Duration::from_millis(50)),
        );
        let cache = cache_with(&fetcher, &config(Duration::from_secs(60), Duration::from_secs(600)));
        let issuer = issuer();

        let seen = cache.get_keys(&issuer).await.unwrap();
        let results = join_all((0..8).map(|_| cache.force_refetch(&issuer, &seen))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_forced_refetch_cooldown() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let config = KeySetConfig {
            forced_refetch_cooldown: Duration::from_secs(30),
            ..KeySetConfig::default()
        };
        let cache = cache_with(&fetcher, &config);

        let seen = cache.get_keys(&issuer()).await.unwrap();
        let same = cache.force_refetch(&issuer(), &seen).await.unwrap();
        assert_eq!(same.generation(), seen.generation());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let cache = cache_with(&fetcher, &KeySetConfig::default());

        cache.get_keys(&issuer()).await.unwrap();
        cache.invalidate(&issuer()).await;
        assert!(cache.is_empty().await);

        cache.get_keys(&issuer()).await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }

    #[test]
    fn test_only_signing_keys_are_kept() {
        let sig = TestIdp::new("sig-key");
        let mut untagged = TestIdp::new("untagged-key").jwk();
        untagged.as_object_mut().unwrap().remove("use");
        let mut enc = TestIdp::new("enc-key").jwk();
        enc["use"] = serde_json::json!("enc");
        let mut other = TestIdp::new("other-key").jwk();
        other["use"] = serde_json::json!("tls");
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [sig.jwk(), untagged, enc, other]
        }))
        .unwrap();

        let set = KeySet::from_jwk_set(&jwks, 1);
        assert_eq!(set.len(), 2);
        assert!(set.find("sig-key").is_some());
        assert!(set.find("untagged-key").is_some());
        assert!(set.find("enc-key").is_none());
        assert!(set.find("other-key").is_none());
    }

    #[test]
    fn test_key_algorithm_binding() {
        let idp = TestIdp::new("key-1");
        let set = KeySet::from_jwk_set(&idp.jwk_set(), 1);
        let key = set.find("key-1").unwrap();
        assert!(key.permits(Algorithm::ES384));
        assert!(!key.permits(Algorithm::RS256));
    }

    #[test]
    fn test_normalize_issuer_key() {
        let a = Url::parse("https://login.example.com/tenant/v2.0").unwrap();
        let b = Url::parse("https://login.example.com/tenant/v2.0/").unwrap();
        assert_eq!(normalize_issuer_key(&a), normalize_issuer_key(&b));
    }
}
