//! Cached credentials with single-flight refresh
//!
//! This library keeps one credential per [`TokenCoordinator`] and hands it out
//! for as long as it remains valid. When the credential is missing, expired, or
//! known to have been rejected, the coordinator obtains a new one from its
//! [token source][sources::AsyncTokenSource].
//!
//! No matter how many tasks ask for a credential at once, at most one request to
//! the token source is ever outstanding. Everyone who asks while a refresh is in
//! flight shares its outcome, whether that is a new credential or an error.
//!
//! A credential's expiry is fixed when it is received: the lifetime declared by
//! the authority, less a small [safety margin][DEFAULT_SAFETY_MARGIN] so that it
//! is not presented in the instant before the authority stops accepting it.
//!
//! ```
//! use tollgate_tokens::{sources::ConstTokenSource, TokenCoordinator};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let coordinator = TokenCoordinator::new(ConstTokenSource::new("token"));
//!
//! let credential = coordinator.get(false).await.unwrap();
//! assert_eq!(credential.access_token().as_str(), "token");
//!
//! // After the server rejects a credential, ask for a new one regardless of expiry.
//! let credential = coordinator.get(true).await.unwrap();
//! assert_eq!(credential.scheme().as_str(), "Bearer");
//! # }
//! ```
//!
//! # Features
//!
//! * `oauth2` (default): Provides a token source for the OAuth2 _client credentials_ flow.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod cache;
mod coordinator;
pub mod sources;
mod tokens;

pub use braids::*;
pub use coordinator::{RefreshFailure, SourcePanicked, TokenCoordinator};
pub use tokens::{
    Credential, CredentialLifetimeConfig, IssuedToken, TokenScheme, DEFAULT_SAFETY_MARGIN,
};
