//! Middleware to automatically attach credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`TokenRefreshMiddleware`] in the middleware stack to attach the
//! credential held by a [`TokenCoordinator`] to each outbound request.
//!
//! If the server answers with one of the configured _invalid token_ statuses
//! (by default, only `401 Unauthorized`), the middleware forces the coordinator
//! to refresh its credential and sends the request again, exactly once. A second
//! rejection is handed back to the caller as-is.
//!
//! ```
//! use tollgate_reqwest::TokenRefreshMiddleware;
//! use tollgate_tokens::{sources::ConstTokenSource, TokenCoordinator};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let coordinator = TokenCoordinator::new(ConstTokenSource::new("token"));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(TokenRefreshMiddleware::new(coordinator))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The header name, the way a credential is formatted into a header value, and
//! the statuses treated as a rejected credential can all be changed:
//!
//! ```
//! use tollgate_reqwest::TokenRefreshMiddleware;
//! use tollgate_tokens::{sources::ConstTokenSource, TokenCoordinator};
//! use reqwest::{header::HeaderName, StatusCode};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let coordinator = TokenCoordinator::new(ConstTokenSource::new("token"));
//!
//! TokenRefreshMiddleware::new(coordinator)
//!     .with_header_name(HeaderName::from_static("x-api-key"))
//!     .with_header_builder(|credential| credential.access_token().as_str().to_owned())
//!     .with_invalid_token_statuses([StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN]);
//! # }
//! ```
//!
//! The middleware can also be configured to attach a credential only
//! conditionally. Requests that the predicate rejects pass through untouched.
//!
//! ```
//! use tollgate_reqwest::{AllowedHosts, SecureTransport, TokenRefreshMiddleware};
//! use predicates::prelude::PredicateBooleanExt;
//! # use tollgate_tokens::{sources::ConstTokenSource, TokenCoordinator};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let coordinator = TokenCoordinator::new(ConstTokenSource::new("token"));
//!
//! TokenRefreshMiddleware::new(coordinator)
//!     .with_predicate(SecureTransport.and(AllowedHosts::new(["api.example.com"])));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use reqwest::{
    header::{self, HeaderName, HeaderValue},
    Request, Response, StatusCode,
};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;
use tollgate_clock::{Clock, System};
use tollgate_tokens::{sources::AsyncTokenSource, Credential, TokenCoordinator};

mod filters;
mod options;

pub use crate::options::{ConfigError, RefreshOptions};
pub use crate::filters::{AllRequests, AllowedHosts, SecureTransport};

/// Formats a credential into a header value
pub type HeaderBuilder = Arc<dyn Fn(&Credential) -> String + Send + Sync>;

/// Formats a credential as `"{scheme} {value}"`, such as `Bearer abc123`
pub fn default_header_value(credential: &Credential) -> String {
    format!(
        "{} {}",
        credential.scheme(),
        credential.access_token().as_str()
    )
}

/// The formatted credential is not a legal header value
#[derive(Debug, Error)]
#[error("credential cannot be represented as a header value")]
pub struct InvalidCredentialHeader(#[from] header::InvalidHeaderValue);

/// Where a request is in the retry protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// Sent with whatever credential the coordinator had on hand
    Initial,
    /// Sent again after a forced refresh; never retried further
    Retried,
}

impl Attempt {
    /// The next state after the server rejects the credential, if any
    fn after_rejection(self) -> Option<Self> {
        match self {
            Self::Initial => Some(Self::Retried),
            Self::Retried => None,
        }
    }
}

/// A middleware that attaches a credential to outgoing requests and replays a
/// request once with a refreshed credential if the server rejects it
pub struct TokenRefreshMiddleware<S, C = System, P = AllRequests> {
    coordinator: TokenCoordinator<S, C>,
    header_name: HeaderName,
    header_builder: HeaderBuilder,
    invalid_token_statuses: Vec<StatusCode>,
    predicate: P,
}

impl<S, C> TokenRefreshMiddleware<S, C, AllRequests> {
    /// Construct a new middleware from a token coordinator
    ///
    /// By default, a credential is attached to every request in the
    /// `authorization` header, formatted by [`default_header_value()`], and a
    /// `401 Unauthorized` response triggers a single retry.
    pub fn new(coordinator: TokenCoordinator<S, C>) -> Self {
        Self {
            coordinator,
            header_name: header::AUTHORIZATION,
            header_builder: Arc::new(default_header_value),
            invalid_token_statuses: vec![StatusCode::UNAUTHORIZED],
            predicate: AllRequests,
        }
    }
}

impl<S, C, P> TokenRefreshMiddleware<S, C, P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> TokenRefreshMiddleware<S, C, Q> {
        TokenRefreshMiddleware {
            coordinator: self.coordinator,
            header_name: self.header_name,
            header_builder: self.header_builder,
            invalid_token_statuses: self.invalid_token_statuses,
            predicate,
        }
    }

    /// Sets the header that carries the credential
    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    /// Sets how a credential is formatted into the header value
    pub fn with_header_builder<F>(mut self, header_builder: F) -> Self
    where
        F: Fn(&Credential) -> String + Send + Sync + 'static,
    {
        self.header_builder = Arc::new(header_builder);
        self
    }

    /// Sets the response statuses that indicate the credential was rejected
    pub fn with_invalid_token_statuses(
        mut self,
        statuses: impl IntoIterator<Item = StatusCode>,
    ) -> Self {
        self.invalid_token_statuses = statuses.into_iter().collect();
        self
    }

    /// Applies a deserialized set of options
    pub fn with_options(self, options: &RefreshOptions) -> std::result::Result<Self, ConfigError> {
        let header_name = options.header_name()?;
        let statuses = options.status_codes()?;
        Ok(self
            .with_header_name(header_name)
            .with_invalid_token_statuses(statuses))
    }

    /// The token coordinator backing this middleware
    pub fn coordinator(&self) -> &TokenCoordinator<S, C> {
        &self.coordinator
    }

    fn is_invalid_token_status(&self, status: StatusCode) -> bool {
        self.invalid_token_statuses.contains(&status)
    }

    fn attach_credential(
        &self,
        req: &mut Request,
        credential: &Credential,
    ) -> std::result::Result<(), InvalidCredentialHeader> {
        let mut value = HeaderValue::try_from((self.header_builder)(credential))?;
        value.set_sensitive(true);
        req.headers_mut().insert(self.header_name.clone(), value);
        Ok(())
    }
}

impl<S, C, P> TokenRefreshMiddleware<S, C, P>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn obtain_credential(&self, force_refresh: bool) -> Result<Arc<Credential>> {
        let credential = self
            .coordinator
            .get(force_refresh)
            .await
            .map_err(reqwest_middleware::Error::middleware)?;

        tracing::trace!(
            force_refresh,
            credential.scheme = %credential.scheme(),
            credential.lifetime = credential.lifetime().0,
            credential.issued = credential.issued().0,
            credential.expiry = credential.expiry().0,
            "obtained credential"
        );

        Ok(credential)
    }
}

impl<S, C, P> Clone for TokenRefreshMiddleware<S, C, P>
where
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            header_name: self.header_name.clone(),
            header_builder: Arc::clone(&self.header_builder),
            invalid_token_statuses: self.invalid_token_statuses.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S, C, P> fmt::Debug for TokenRefreshMiddleware<S, C, P>
where
    S: fmt::Debug,
    C: fmt::Debug,
    P: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefreshMiddleware")
            .field("coordinator", &self.coordinator)
            .field("header_name", &self.header_name)
            .field("invalid_token_statuses", &self.invalid_token_statuses)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<S, C, P> Middleware for TokenRefreshMiddleware<S, C, P>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
    P: predicates::Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            tracing::trace!(url = %req.url(), "request excluded by predicate");
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(&self.header_name) {
            tracing::trace!(header = %self.header_name, "request already carries a credential");
            return next.run(req, extensions).await;
        }

        let credential = self.obtain_credential(false).await?;
        self.attach_credential(&mut req, &credential)
            .map_err(reqwest_middleware::Error::middleware)?;

        let mut attempt = Attempt::Initial;
        loop {
            let replay = match attempt {
                Attempt::Initial => req.try_clone(),
                Attempt::Retried => None,
            };

            let resp = next.clone().run(req, extensions).await?;
            let status = resp.status();

            if !self.is_invalid_token_status(status) {
                return Ok(resp);
            }

            let (Some(next_attempt), Some(mut replay)) = (attempt.after_rejection(), replay)
            else {
                match attempt {
                    Attempt::Initial => tracing::warn!(
                        status = status.as_u16(),
                        "credential rejected but request body cannot be replayed"
                    ),
                    Attempt::Retried => tracing::warn!(
                        status = status.as_u16(),
                        "refreshed credential rejected, not retrying again"
                    ),
                }
                return Ok(resp);
            };

            tracing::debug!(
                status = status.as_u16(),
                "credential rejected, refreshing and replaying request"
            );

            let credential = self.obtain_credential(true).await?;
            self.attach_credential(&mut replay, &credential)
                .map_err(reqwest_middleware::Error::middleware)?;

            req = replay;
            attempt = next_attempt;
        }
    }
}
