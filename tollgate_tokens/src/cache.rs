//! The latest known credential

use std::sync::Arc;

use thiserror::Error;
use tollgate_clock::{Clock, UnixTime};

use crate::Credential;

/// A read was attempted before any credential had been stored
#[derive(Clone, Copy, Debug, Error)]
#[error("no credential has been stored yet")]
pub struct UninitializedRead;

/// Holds at most one credential and answers validity queries about it
///
/// This type does no synchronization of its own. Shared use goes through the
/// [`TokenCoordinator`][crate::TokenCoordinator], which serializes all mutation.
#[derive(Debug, Default)]
pub struct CredentialCache {
    credential: Option<Arc<Credential>>,
}

impl CredentialCache {
    /// Constructs an empty cache
    pub const fn new() -> Self {
        Self { credential: None }
    }

    /// Replaces the held credential
    pub fn set(&mut self, credential: Arc<Credential>) {
        self.credential = Some(credential);
    }

    /// Forgets the held credential, if any
    pub fn clear(&mut self) {
        self.credential = None;
    }

    /// Whether a credential is held and still valid according to `clock`
    #[inline]
    pub fn is_valid<C: Clock>(&self, clock: &C) -> bool {
        self.is_valid_at(clock.now())
    }

    /// Whether a credential is held and still valid as of `time`
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        self.credential
            .as_deref()
            .map_or(false, |c| c.is_valid_at(time))
    }

    /// Reads the held credential, regardless of validity
    pub fn read(&self) -> Result<Arc<Credential>, UninitializedRead> {
        self.credential.clone().ok_or(UninitializedRead)
    }

    /// Reads the held credential only if it is valid as of `time`
    pub(crate) fn read_valid_at(&self, time: UnixTime) -> Option<Arc<Credential>> {
        self.credential
            .as_ref()
            .filter(|c| c.is_valid_at(time))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use tollgate_clock::TestClock;

    use super::*;
    use crate::{CredentialLifetimeConfig, IssuedToken, TokenScheme};

    fn credential(value: &str, lifetime: u64, clock: &TestClock) -> Arc<Credential> {
        let config = CredentialLifetimeConfig::default().with_clock(clock.clone());
        Arc::new(config.create_credential(IssuedToken::new(
            value,
            TokenScheme::Bearer,
            lifetime,
        )))
    }

    #[test]
    fn empty_cache_is_invalid() {
        let cache = CredentialCache::new();
        assert!(!cache.is_valid_at(UnixTime(0)));
    }

    #[test]
    fn empty_cache_read_is_an_error() {
        let cache = CredentialCache::new();
        assert!(cache.read().is_err());
    }

    #[test]
    fn set_credential_is_valid_until_expiry() {
        let clock = TestClock::new(UnixTime(1_000));
        let mut cache = CredentialCache::new();
        cache.set(credential("tok", 10, &clock));

        assert!(cache.is_valid(&clock));
        clock.set(UnixTime(1_000 + 8_000));
        assert!(cache.is_valid(&clock));
        clock.set(UnixTime(1_000 + 8_001));
        assert!(!cache.is_valid(&clock));
    }

    #[test]
    fn read_returns_credential_verbatim_even_when_expired() {
        let clock = TestClock::new(UnixTime(0));
        let mut cache = CredentialCache::new();
        cache.set(credential("tok", 1, &clock));
        clock.set(UnixTime(60_000));

        let read = cache.read().unwrap();
        assert_eq!(read.access_token().as_str(), "tok");
        assert_eq!(read.scheme(), &TokenScheme::Bearer);
        assert!(cache.read_valid_at(clock.now()).is_none());
    }

    #[test]
    fn set_replaces_previous_credential() {
        let clock = TestClock::new(UnixTime(0));
        let mut cache = CredentialCache::new();
        cache.set(credential("first", 60, &clock));
        cache.set(credential("second", 60, &clock));

        assert_eq!(cache.read().unwrap().access_token().as_str(), "second");
    }

    #[test]
    fn clear_forgets_credential() {
        let clock = TestClock::new(UnixTime(0));
        let mut cache = CredentialCache::new();
        cache.set(credential("tok", 60, &clock));
        cache.clear();

        assert!(!cache.is_valid(&clock));
        assert!(cache.read().is_err());
    }
}
