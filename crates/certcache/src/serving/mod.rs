//! In-memory certificate serving cache
//!
//! Answers TLS handshake certificate lookups by hostname. Certificates are
//! fetched from a [`BackingStore`] as PEM blobs, parsed, verified against a
//! root set and then kept in memory for a fixed TTL, so the expensive work
//! happens once per TTL window instead of once per handshake.
//!
//! # Lookup
//!
//! 1. Validate and IDNA-normalize the requested server name
//! 2. Return the in-memory entry if it has not expired
//! 3. Otherwise fetch the blob, parse the private key and chain, verify the
//!    chain for the requested name at the current (injected) time
//! 4. Insert the result with `expiry = now + ttl` and return it
//!
//! The map lock is never held across the store fetch. Concurrent misses for
//! the same host each fetch and verify on their own; the last insert wins.

mod error;
mod parse;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, RootCertStore};
use tracing::{debug, info, trace, warn};

use crate::store::BackingStore;

pub use error::CertError;
pub use parse::LeafInfo;

/// Default in-memory freshness window
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 3600);

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Options for a [`CertServingCache`]
#[derive(Clone)]
pub struct ServingCacheConfig {
    /// Trust anchors for chain verification; `None` uses the bundled web PKI roots
    pub roots: Option<Arc<RootCertStore>>,
    /// How long a verified certificate is served before it is fetched again
    pub ttl: Duration,
    /// Time source for expiry and verification
    pub clock: Clock,
    /// Upper bound on a single store fetch; `None` waits for the store
    pub fetch_timeout: Option<Duration>,
}

impl Default for ServingCacheConfig {
    fn default() -> Self {
        Self {
            roots: None,
            ttl: DEFAULT_TTL,
            clock: Arc::new(SystemTime::now),
            fetch_timeout: None,
        }
    }
}

impl ServingCacheConfig {
    pub fn with_roots(mut self, roots: Arc<RootCertStore>) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ServingCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingCacheConfig")
            .field("custom_roots", &self.roots.as_ref().map(|r| r.len()))
            .field("ttl", &self.ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

/// A verified certificate ready to hand to rustls
#[derive(Debug)]
pub struct ServedCertificate {
    certified_key: Arc<CertifiedKey>,
    leaf: LeafInfo,
}

impl ServedCertificate {
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    /// Leaf first, then intermediates
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    pub fn leaf(&self) -> &LeafInfo {
        &self.leaf
    }
}

struct CertEntry {
    certificate: Arc<ServedCertificate>,
    expiry: SystemTime,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServingCacheStats {
    /// Lookups answered from memory
    pub hits: u64,
    /// Lookups that went to the store
    pub misses: u64,
    /// Store fetches that failed (including cache misses)
    pub fetch_errors: u64,
    /// Fetched blobs rejected by parsing or verification
    pub validation_errors: u64,
    /// Entries inserted or replaced
    pub refreshes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_errors: AtomicU64,
    validation_errors: AtomicU64,
    refreshes: AtomicU64,
}

/// TTL cache of verified certificates keyed by hostname
pub struct CertServingCache {
    store: Arc<dyn BackingStore>,
    verifier: Arc<WebPkiServerVerifier>,
    ttl: Duration,
    clock: Clock,
    fetch_timeout: Option<Duration>,
    entries: Mutex<HashMap<String, CertEntry>>,
    counters: Counters,
}

impl CertServingCache {
    /// Create a cache serving certificates from `store`
    ///
    /// # Errors
    ///
    /// Fails if the configured root set cannot back a verifier (for example
    /// an empty [`RootCertStore`]).
    pub fn new(store: Arc<dyn BackingStore>, config: ServingCacheConfig) -> Result<Self, CertError> {
        let roots = config.roots.unwrap_or_else(|| {
            Arc::new(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
        });
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let verifier = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider).build()?;

        info!(
            roots = roots.len(),
            ttl_secs = config.ttl.as_secs(),
            fetch_timeout_ms = config.fetch_timeout.map(|t| t.as_millis() as u64),
            "Created certificate serving cache"
        );

        Ok(Self {
            store,
            verifier,
            ttl: config.ttl,
            clock: config.clock,
            fetch_timeout: config.fetch_timeout,
            entries: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    /// Look up the certificate for `server_name`
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<ServedCertificate>, CertError> {
        let name = normalize_server_name(server_name)?;
        let now = (self.clock)();

        if let Some(entry) = self.entries.lock().get(&name) {
            if entry.expiry > now {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(server_name = %name, "Certificate cache hit");
                return Ok(entry.certificate.clone());
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        debug!(server_name = %name, "Fetching certificate from store");
        let data = self.fetch(&name).await.inspect_err(|_| {
            self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
        })?;

        let certificate = match self.load(&name, &data, now) {
            Ok(certificate) => Arc::new(certificate),
            Err(e) => {
                self.counters.validation_errors.fetch_add(1, Ordering::Relaxed);
                warn!(server_name = %name, error = %e, "Rejected stored certificate");
                return Err(e);
            }
        };

        // A TTL past the end of representable time never expires
        let expiry = now
            .checked_add(self.ttl)
            .unwrap_or_else(|| UNIX_EPOCH + Duration::from_secs(u32::MAX as u64 * 64));
        self.entries.lock().insert(
            name.clone(),
            CertEntry {
                certificate: certificate.clone(),
                expiry,
            },
        );
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);

        info!(
            server_name = %name,
            not_after = %certificate.leaf.not_after,
            ttl_secs = self.ttl.as_secs(),
            "Cached certificate"
        );
        Ok(certificate)
    }

    /// Look up the certificate for the SNI name in a ClientHello
    ///
    /// A hello without SNI is treated as an empty name.
    pub async fn resolve_hello(&self, hello: &ClientHello<'_>) -> Result<Arc<ServedCertificate>, CertError> {
        let name = hello.server_name().unwrap_or_default().to_string();
        self.get_certificate(&name).await
    }

    /// Number of entries held in memory, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ServingCacheStats {
        ServingCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetch_errors: self.counters.fetch_errors.load(Ordering::Relaxed),
            validation_errors: self.counters.validation_errors.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
        }
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>, CertError> {
        let fetch = self.store.get(name);
        match self.fetch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| CertError::FetchTimeout {
                    name: name.to_string(),
                    timeout,
                })?
                .map_err(CertError::from),
            None => fetch.await.map_err(CertError::from),
        }
    }

    /// Parse and verify a fetched blob
    fn load(&self, name: &str, data: &[u8], now: SystemTime) -> Result<ServedCertificate, CertError> {
        let parsed = parse::parse_blob(name, data)?;
        let invalid = |source| CertError::InvalidLeaf {
            name: name.to_string(),
            source,
        };

        let (leaf, intermediates) = parsed
            .chain
            .split_first()
            .ok_or_else(|| CertError::NoCertificates(name.to_string()))?;
        let intermediates: Vec<CertificateDer<'static>> =
            intermediates.iter().map(|c| c.der.clone()).collect();

        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| CertError::InvalidCharacter(name.to_string()))?;
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();

        self.verifier
            .verify_server_cert(
                &leaf.der,
                &intermediates,
                &server_name,
                &[],
                UnixTime::since_unix_epoch(since_epoch),
            )
            .map_err(invalid)?;

        let mut chain = Vec::with_capacity(parsed.chain.len());
        chain.push(leaf.der.clone());
        chain.extend(intermediates);

        let certified_key = CertifiedKey::new(chain, parsed.key);
        if let Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) =
            certified_key.keys_match()
        {
            return Err(CertError::KeyMismatch(name.to_string()));
        }

        Ok(ServedCertificate {
            certified_key: Arc::new(certified_key),
            leaf: leaf.info.clone(),
        })
    }
}

impl fmt::Debug for CertServingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertServingCache")
            .field("ttl", &self.ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Validate a requested server name and convert it to its ASCII form
pub fn normalize_server_name(name: &str) -> Result<String, CertError> {
    if name.is_empty() {
        return Err(CertError::MissingServerName);
    }

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let labels: Vec<&str> = trimmed.split('.').collect();
    if labels.iter().filter(|l| !l.is_empty()).count() < 2 {
        return Err(CertError::InvalidComponentCount(name.to_string()));
    }
    if labels.iter().any(|l| l.is_empty()) {
        return Err(CertError::InvalidCharacter(name.to_string()));
    }

    // ASCII must already be letters, digits, hyphens and dots; everything
    // else is left to IDNA and checked again on the way out
    if name.chars().any(|c| c.is_ascii() && !is_ldh(c) && c != '.') {
        return Err(CertError::InvalidCharacter(name.to_string()));
    }

    let ascii = match url::Host::parse(trimmed) {
        Ok(url::Host::Domain(ascii)) => ascii,
        _ => return Err(CertError::InvalidCharacter(name.to_string())),
    };
    let valid = ascii
        .split('.')
        .all(|label| !label.is_empty() && label.len() <= 63 && label.chars().all(is_ldh));
    if !valid {
        return Err(CertError::InvalidCharacter(name.to_string()));
    }
    Ok(ascii)
}

fn is_ldh(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}
