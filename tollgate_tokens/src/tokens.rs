use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tollgate_clock::{Clock, DurationMillis, System, UnixTime};

use super::{AccessToken, AccessTokenRef, Scope, ScopeRef};

/// The default amount of time shaved off a credential's declared lifetime
///
/// A credential is treated as expired this long before the authority would
/// stop accepting it, so that a request sent at the last moment does not
/// arrive with a dead credential.
pub const DEFAULT_SAFETY_MARGIN: DurationMillis = DurationMillis::from_millis(2000);

/// The scheme used to present a credential in an authorization header
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TokenScheme {
    /// HTTP basic authentication
    Basic,
    /// A bearer token
    #[default]
    Bearer,
    /// Any other scheme, presented exactly as given
    Other(String),
}

impl TokenScheme {
    /// The scheme as it should appear in a header
    pub fn as_str(&self) -> &str {
        match self {
            Self::Basic => "Basic",
            Self::Bearer => "Bearer",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for TokenScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenScheme {
    type Err = std::convert::Infallible;

    /// Parses a scheme, recognizing `basic` and `bearer` in any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("bearer") {
            Self::Bearer
        } else if s.eq_ignore_ascii_case("basic") {
            Self::Basic
        } else {
            Self::Other(s.to_owned())
        })
    }
}

impl From<&str> for TokenScheme {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(scheme) => scheme,
            Err(never) => match never {},
        }
    }
}

impl Serialize for TokenScheme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TokenScheme {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Ok(Self::from(&*s))
    }
}

/// A credential as handed back by a token source, before its expiry is known
///
/// The wire names follow the OAuth2 token response so that this type can be
/// deserialized directly from most token endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The credential value
    pub access_token: AccessToken,

    /// The scheme used to present the credential
    #[serde(rename = "token_type", default)]
    pub scheme: TokenScheme,

    /// The declared lifetime of the credential, in seconds
    pub expires_in: u64,

    /// The scope granted, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl IssuedToken {
    /// Constructs a newly issued token
    pub fn new(
        access_token: impl Into<AccessToken>,
        scheme: TokenScheme,
        expires_in_secs: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            scheme,
            expires_in: expires_in_secs,
            scope: None,
        }
    }

    /// Attaches a granted scope
    pub fn with_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// A credential with its expiry fixed at the moment it was received
///
/// Credentials are never mutated. A refreshed credential replaces the old one
/// wholesale.
#[derive(Clone, Debug)]
pub struct Credential {
    access_token: AccessToken,
    scheme: TokenScheme,
    scope: Option<Scope>,
    lifetime: DurationMillis,
    issued: UnixTime,
    expiry: UnixTime,
}

impl Credential {
    /// Gets the credential value
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the scheme used to present the credential
    #[inline]
    pub fn scheme(&self) -> &TokenScheme {
        &self.scheme
    }

    /// Gets the granted scope, if the authority reported one
    #[inline]
    pub fn scope(&self) -> Option<&ScopeRef> {
        self.scope.as_deref()
    }

    /// Gets the lifetime declared by the authority
    #[inline]
    pub fn lifetime(&self) -> DurationMillis {
        self.lifetime
    }

    /// Gets the time that the credential was received
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time after which the credential is considered stale
    ///
    /// This already accounts for the safety margin.
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Whether the credential may still be presented as of `time`
    ///
    /// An empty credential value is never valid. The expiry instant itself is
    /// still considered valid.
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        !self.access_token.as_str().is_empty() && self.expiry >= time
    }

    /// Gets a duration for how much longer the credential would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationMillis {
        self.expiry - time
    }
}

/// Configuration for stamping freshly received tokens with an expiry
#[derive(Clone, Debug)]
pub struct CredentialLifetimeConfig<C = System> {
    safety_margin: DurationMillis,
    clock: C,
}

impl Default for CredentialLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Uses a safety margin of two seconds and the system clock.
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            clock: System,
        }
    }
}

impl CredentialLifetimeConfig {
    /// Constructs a new lifetime configuration with a custom safety margin
    pub fn new(safety_margin: DurationMillis) -> Self {
        Self {
            safety_margin,
            clock: System,
        }
    }
}

impl<C> CredentialLifetimeConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> CredentialLifetimeConfig<D> {
        CredentialLifetimeConfig {
            safety_margin: self.safety_margin,
            clock,
        }
    }

    /// The configured safety margin
    #[inline]
    pub fn safety_margin(&self) -> DurationMillis {
        self.safety_margin
    }

    /// The clock used to judge issuance and validity
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> CredentialLifetimeConfig<C> {
    /// Stamps a freshly received token with its issue time and expiry
    ///
    /// The expiry is `now + lifetime - safety_margin`, floored at `now`.
    pub fn create_credential(&self, token: IssuedToken) -> Credential {
        let issued = self.clock.now();
        let lifetime = DurationMillis::from_secs(token.expires_in);
        Credential {
            access_token: token.access_token,
            scheme: token.scheme,
            scope: token.scope,
            lifetime,
            issued,
            expiry: issued + lifetime.saturating_sub(self.safety_margin),
        }
    }
}
