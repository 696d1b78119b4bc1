use std::{
    any::Any,
    error, fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tollgate_clock::{Clock, System};

use crate::{
    cache::CredentialCache, sources::AsyncTokenSource, Credential, CredentialLifetimeConfig,
};

/// The token source failed to produce a credential
///
/// Every caller waiting on the same refresh receives a clone of the same
/// failure. The error returned by the source is available through
/// [`source()`][error::Error::source] or [`get_ref()`][Self::get_ref].
#[derive(Clone, Debug, Error)]
#[error("unable to refresh credential")]
pub struct RefreshFailure {
    #[source]
    source: Arc<dyn error::Error + Send + Sync + 'static>,
}

impl RefreshFailure {
    fn new<E: error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            source: Arc::new(error),
        }
    }

    /// The error reported by the token source
    pub fn get_ref(&self) -> &(dyn error::Error + Send + Sync + 'static) {
        &*self.source
    }
}

/// The token source panicked while producing a credential
///
/// Reported to waiting callers as the source of a [`RefreshFailure`].
#[derive(Debug, Error)]
#[error("token source panicked: {message}")]
pub struct SourcePanicked {
    message: String,
}

impl SourcePanicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload
                .downcast_ref::<&'static str>()
                .map_or("<non-string panic payload>", |m| *m)
                .to_owned(),
        };
        Self { message }
    }

    /// The panic message, if the payload was a string
    pub fn message(&self) -> &str {
        &self.message
    }
}

type RefreshResult = Result<Arc<Credential>, RefreshFailure>;
type InFlightRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Hands out a valid credential, refreshing it from a token source when needed
///
/// Concurrent callers that find the credential missing or expired share a single
/// call to the token source. Clones share the same cache and in-flight refresh;
/// separately constructed coordinators share nothing.
///
/// The coordinator imposes no timeout on the token source. If the source never
/// completes, every caller waiting on it waits forever.
pub struct TokenCoordinator<S, C = System> {
    inner: Arc<Inner<S, C>>,
}

struct Inner<S, C> {
    source: tokio::sync::Mutex<S>,
    lifetime_config: CredentialLifetimeConfig<C>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    cache: CredentialCache,
    in_flight: Option<InFlightRefresh>,
}

impl<S, C> Inner<S, C> {
    fn state(&self) -> MutexGuard<'_, State> {
        // State is only ever replaced wholesale, so a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, C> Clone for TokenCoordinator<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> TokenCoordinator<S, System>
where
    S: AsyncTokenSource + 'static,
{
    /// Constructs a coordinator over `token_source` using the default lifetime
    /// configuration
    pub fn new(token_source: S) -> Self {
        Self::with_lifetime_config(token_source, CredentialLifetimeConfig::default())
    }
}

impl<S, C> TokenCoordinator<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a coordinator with a custom safety margin or clock
    pub fn with_lifetime_config(token_source: S, lifetime_config: CredentialLifetimeConfig<C>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source: tokio::sync::Mutex::new(token_source),
                lifetime_config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Obtains a credential ready to be presented
    ///
    /// If the cached credential is valid and `force_refresh` is `false`, it is
    /// returned without consulting the token source. Otherwise a refresh is
    /// required: if one is already in flight, this call waits on it, and if not,
    /// this call starts one. A refresh failure is reported to every waiting
    /// caller and leaves the cached credential untouched.
    pub async fn get(&self, force_refresh: bool) -> Result<Arc<Credential>, RefreshFailure> {
        let refresh = {
            let mut state = self.inner.state();

            if !force_refresh {
                let now = self.inner.lifetime_config.clock().now();
                if let Some(credential) = state.cache.read_valid_at(now) {
                    tracing::trace!(
                        expiry = credential.expiry().0,
                        until_expired = credential.until_expired_at(now).0,
                        "using cached credential"
                    );
                    return Ok(credential);
                }
            }

            match &state.in_flight {
                Some(refresh) => {
                    tracing::debug!(force_refresh, "joining in-flight credential refresh");
                    refresh.clone()
                }
                None => {
                    tracing::debug!(force_refresh, "starting credential refresh");
                    let refresh = self.start_refresh();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Gets the cached credential if it is still valid, without refreshing
    pub fn current(&self) -> Option<Arc<Credential>> {
        let now = self.inner.lifetime_config.clock().now();
        self.inner.state().cache.read_valid_at(now)
    }

    /// Forgets the cached credential so that the next call to [`get()`][Self::get]
    /// refreshes
    ///
    /// A refresh already in flight is unaffected and will still populate the cache
    /// when it completes.
    pub fn invalidate(&self) {
        tracing::debug!("invalidating cached credential");
        self.inner.state().cache.clear();
    }

    fn start_refresh(&self) -> InFlightRefresh {
        let inner = Arc::clone(&self.inner);

        async move {
            let result = AssertUnwindSafe(async {
                let mut source = inner.source.lock().await;
                source.request_token().await.map_err(RefreshFailure::new)
            })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(RefreshFailure::new(SourcePanicked::from_payload(payload)))
            });

            // Clear the slot before anyone observes the outcome so that the next
            // caller can start a fresh attempt, including after a failure.
            let mut state = inner.state();
            state.in_flight = None;

            match result {
                Ok(token) => {
                    let credential = Arc::new(inner.lifetime_config.create_credential(token));

                    tracing::info!(
                        scheme = %credential.scheme(),
                        has_scope = credential.scope().is_some(),
                        lifetime = credential.lifetime().0,
                        issued = credential.issued().0,
                        expiry = credential.expiry().0,
                        "received new credential"
                    );

                    state.cache.set(Arc::clone(&credential));
                    Ok(credential)
                }
                Err(failure) => {
                    tracing::warn!(
                        error = (failure.get_ref() as &dyn error::Error),
                        "error refreshing credential"
                    );
                    Err(failure)
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl<S, C> fmt::Debug for TokenCoordinator<S, C>
where
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("TokenCoordinator")
            .field("lifetime_config", &self.inner.lifetime_config)
            .field("cache", &state.cache)
            .field("refresh_in_flight", &state.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tollgate_clock::{DurationMillis, TestClock, UnixTime};
    use tokio::sync::Notify;

    use super::*;
    use crate::{IssuedToken, TokenScheme};

    /// Hands out `tok1`, `tok2`, … and counts how often it was asked
    #[derive(Debug)]
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        lifetime: u64,
        delay: Option<Duration>,
        fail: bool,
    }

    impl CountingSource {
        fn new(lifetime: u64) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Self {
                calls: Arc::clone(&calls),
                lifetime,
                delay: None,
                fail: false,
            };
            (source, calls)
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl AsyncTokenSource for CountingSource {
        type Error = io::Error;

        async fn request_token(&mut self) -> Result<IssuedToken, Self::Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "authority unavailable"));
            }
            Ok(IssuedToken::new(
                format!("tok{}", n),
                TokenScheme::Bearer,
                self.lifetime,
            ))
        }
    }

    fn coordinator_at(
        source: CountingSource,
        clock: &TestClock,
    ) -> TokenCoordinator<CountingSource, TestClock> {
        TokenCoordinator::with_lifetime_config(
            source,
            CredentialLifetimeConfig::default().with_clock(clock.clone()),
        )
    }

    #[tokio::test]
    async fn first_get_refreshes() {
        let clock = TestClock::new(UnixTime(1_000_000));
        let (source, calls) = CountingSource::new(3600);
        let coordinator = coordinator_at(source, &clock);

        assert!(coordinator.current().is_none());
        let credential = coordinator.get(false).await.unwrap();

        assert_eq!(credential.access_token().as_str(), "tok1");
        assert_eq!(credential.expiry(), UnixTime(1_000_000 + 3_600_000 - 2_000));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_credential_is_reused() {
        let clock = TestClock::new(UnixTime(1_000_000));
        let (source, calls) = CountingSource::new(3600);
        let coordinator = coordinator_at(source, &clock);

        let first = coordinator.get(false).await.unwrap();
        clock.advance(DurationMillis::from_secs(1));
        let second = coordinator.get(false).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed() {
        let clock = TestClock::new(UnixTime(1_000_000));
        let (source, calls) = CountingSource::new(1);
        let coordinator = coordinator_at(source, &clock);

        let first = coordinator.get(false).await.unwrap();
        clock.advance(DurationMillis::from_millis(1));
        let second = coordinator.get(false).await.unwrap();

        assert_eq!(first.access_token().as_str(), "tok1");
        assert_eq!(second.access_token().as_str(), "tok2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_refresh_bypasses_validity() {
        let clock = TestClock::new(UnixTime(1_000_000));
        let (source, calls) = CountingSource::new(3600);
        let coordinator = coordinator_at(source, &clock);

        coordinator.get(false).await.unwrap();
        let forced = coordinator.get(true).await.unwrap();

        assert_eq!(forced.access_token().as_str(), "tok2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            coordinator.current().unwrap().access_token().as_str(),
            "tok2"
        );
    }

    #[tokio::test]
    async fn invalidate_forces_next_get_to_refresh() {
        let clock = TestClock::new(UnixTime(0));
        let (source, calls) = CountingSource::new(3600);
        let coordinator = coordinator_at(source, &clock);

        coordinator.get(false).await.unwrap();
        coordinator.invalidate();
        assert!(coordinator.current().is_none());

        let credential = coordinator.get(false).await.unwrap();
        assert_eq!(credential.access_token().as_str(), "tok2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    mod when_called_concurrently {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn only_one_refresh_is_performed() {
            let clock = TestClock::new(UnixTime(0));
            let (source, calls) = CountingSource::new(3600);
            let coordinator =
                coordinator_at(source.with_delay(Duration::from_millis(50)), &clock);

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move { coordinator.get(false).await })
                })
                .collect();

            for handle in handles {
                let credential = handle.await.unwrap().unwrap();
                assert_eq!(credential.access_token().as_str(), "tok1");
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn forced_refresh_joins_in_flight_refresh() {
            let clock = TestClock::new(UnixTime(0));
            let (source, calls) = CountingSource::new(3600);
            let coordinator =
                coordinator_at(source.with_delay(Duration::from_millis(20)), &clock);

            let (a, b, c) = tokio::join!(
                coordinator.get(false),
                coordinator.get(true),
                coordinator.get(true),
            );

            assert_eq!(a.unwrap().access_token().as_str(), "tok1");
            assert_eq!(b.unwrap().access_token().as_str(), "tok1");
            assert_eq!(c.unwrap().access_token().as_str(), "tok1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn failure_reaches_every_waiter() {
            let clock = TestClock::new(UnixTime(0));
            let (source, calls) = CountingSource::new(3600);
            let coordinator = coordinator_at(
                source.with_delay(Duration::from_millis(20)).failing(),
                &clock,
            );

            let (a, b) = tokio::join!(coordinator.get(false), coordinator.get(false));

            for result in [a, b] {
                let failure = result.unwrap_err();
                let io_error = failure
                    .get_ref()
                    .downcast_ref::<io::Error>()
                    .expect("source error is preserved");
                assert_eq!(io_error.to_string(), "authority unavailable");
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    mod when_refresh_fails {
        use super::*;

        /// Succeeds or fails depending on a shared switch
        #[derive(Debug)]
        struct SwitchableSource {
            fail: Arc<std::sync::atomic::AtomicBool>,
            calls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl AsyncTokenSource for SwitchableSource {
            type Error = io::Error;

            async fn request_token(&mut self) -> Result<IssuedToken, Self::Error> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail.load(Ordering::SeqCst) {
                    Err(io::Error::new(io::ErrorKind::Other, "boom"))
                } else {
                    Ok(IssuedToken::new(format!("tok{}", n), TokenScheme::Bearer, 3600))
                }
            }
        }

        fn switchable() -> (
            TokenCoordinator<SwitchableSource, TestClock>,
            Arc<std::sync::atomic::AtomicBool>,
            Arc<AtomicUsize>,
        ) {
            let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let calls = Arc::new(AtomicUsize::new(0));
            let coordinator = TokenCoordinator::with_lifetime_config(
                SwitchableSource {
                    fail: Arc::clone(&fail),
                    calls: Arc::clone(&calls),
                },
                CredentialLifetimeConfig::default().with_clock(TestClock::new(UnixTime(0))),
            );
            (coordinator, fail, calls)
        }

        #[tokio::test]
        async fn next_call_retries() {
            let (coordinator, fail, calls) = switchable();

            fail.store(true, Ordering::SeqCst);
            assert!(coordinator.get(false).await.is_err());

            fail.store(false, Ordering::SeqCst);
            let credential = coordinator.get(false).await.unwrap();

            assert_eq!(credential.access_token().as_str(), "tok2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn cached_credential_is_kept() {
            let (coordinator, fail, _) = switchable();

            coordinator.get(false).await.unwrap();
            fail.store(true, Ordering::SeqCst);

            assert!(coordinator.get(true).await.is_err());
            assert_eq!(
                coordinator.current().unwrap().access_token().as_str(),
                "tok1"
            );
        }
    }

    #[tokio::test]
    async fn cancelled_starter_does_not_wedge_refresh() {
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let source = {
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            crate::sources::from_fn(move || {
                let release = Arc::clone(&release);
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    release.notified().await;
                    Ok::<_, io::Error>(IssuedToken::new(
                        format!("tok{}", n),
                        TokenScheme::Bearer,
                        3600,
                    ))
                }
            })
        };
        let coordinator = TokenCoordinator::new(source);

        // Start a refresh and abandon it while it is still waiting on the source.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), coordinator.get(false)).await;
        assert!(abandoned.is_err());

        release.notify_one();
        let credential = coordinator.get(false).await.unwrap();

        assert_eq!(credential.access_token().as_str(), "tok1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_source_does_not_wedge_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = {
            let calls = Arc::clone(&calls);
            crate::sources::from_fn(move || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        panic!("token endpoint client blew up");
                    }
                    Ok::<_, io::Error>(IssuedToken::new(
                        format!("tok{}", n),
                        TokenScheme::Bearer,
                        3600,
                    ))
                }
            })
        };
        let coordinator = TokenCoordinator::new(source);

        let failure = coordinator.get(false).await.unwrap_err();
        let panicked = failure
            .get_ref()
            .downcast_ref::<SourcePanicked>()
            .expect("panic is reported as the failure source");
        assert_eq!(panicked.message(), "token endpoint client blew up");

        let retried = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.get(false).await }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(retried.access_token().as_str(), "tok2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn independent_coordinators_share_nothing() {
        let clock = TestClock::new(UnixTime(0));
        let (source_a, calls_a) = CountingSource::new(3600);
        let (source_b, calls_b) = CountingSource::new(3600);
        let a = coordinator_at(source_a, &clock);
        let b = coordinator_at(source_b, &clock);

        a.get(false).await.unwrap();
        b.get(false).await.unwrap();
        a.get(false).await.unwrap();

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    }
}
