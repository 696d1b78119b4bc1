//! Token sources
//!
//! A token source is the refresh function a [`TokenCoordinator`][crate::TokenCoordinator]
//! calls whenever it needs a new credential. The coordinator guarantees that at most one
//! call into its source is outstanding at a time.

use std::{convert::Infallible, error, fmt, future::Future};

use async_trait::async_trait;

use crate::{AccessToken, IssuedToken, TokenScheme};

#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod oauth2;

/// An asynchronous source for tokens
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token from an asynchronous source
    async fn request_token(&mut self) -> Result<IssuedToken, Self::Error>;
}

/// A token source that always hands back the same token
#[derive(Clone, Debug)]
pub struct ConstTokenSource {
    token: IssuedToken,
}

impl ConstTokenSource {
    /// The lifetime reported for constant tokens unless overridden
    pub const DEFAULT_LIFETIME_SECS: u64 = 3600;

    /// Constructs a source handing out `token` as a bearer token
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: IssuedToken::new(token, TokenScheme::Bearer, Self::DEFAULT_LIFETIME_SECS),
        }
    }

    /// Constructs a source handing out a fully specified token
    pub fn from_issued(token: IssuedToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AsyncTokenSource for ConstTokenSource {
    type Error = Infallible;

    async fn request_token(&mut self) -> Result<IssuedToken, Self::Error> {
        Ok(self.token.clone())
    }
}

/// A token source backed by an asynchronous closure
///
/// Construct with [`from_fn()`].
pub struct FnTokenSource<F> {
    f: F,
}

/// Wraps a closure returning a future as a token source
///
/// ```
/// use tollgate_tokens::{sources, IssuedToken, TokenScheme};
///
/// let source = sources::from_fn(|| async {
///     Ok::<_, std::io::Error>(IssuedToken::new("token", TokenScheme::Bearer, 3600))
/// });
/// # let _ = source;
/// ```
pub fn from_fn<F, Fut, E>(f: F) -> FnTokenSource<F>
where
    F: FnMut() -> Fut + Send + Sync,
    Fut: Future<Output = Result<IssuedToken, E>> + Send,
    E: error::Error + Send + Sync + 'static,
{
    FnTokenSource { f }
}

impl<F> fmt::Debug for FnTokenSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, E> AsyncTokenSource for FnTokenSource<F>
where
    F: FnMut() -> Fut + Send + Sync,
    Fut: Future<Output = Result<IssuedToken, E>> + Send,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn request_token(&mut self) -> Result<IssuedToken, Self::Error> {
        (self.f)().await
    }
}
