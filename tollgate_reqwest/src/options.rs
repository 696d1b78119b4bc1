use reqwest::{
    header::{self, HeaderName},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An option value could not be turned into its HTTP form
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured header name is not a legal HTTP header name
    #[error("invalid token header name `{name}`")]
    HeaderName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        source: header::InvalidHeaderName,
    },
    /// A configured status is not a legal HTTP status code
    #[error("invalid token status `{0}`")]
    Status(u16),
}

/// Serializable middleware options, suitable for loading from configuration
///
/// Missing fields take their defaults: `invalid_token_statuses = [401]` and
/// `token_header_name = "authorization"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Response statuses that indicate the server rejected the credential
    pub invalid_token_statuses: Vec<u16>,
    /// The header carrying the credential
    pub token_header_name: String,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            invalid_token_statuses: vec![StatusCode::UNAUTHORIZED.as_u16()],
            token_header_name: header::AUTHORIZATION.as_str().to_owned(),
        }
    }
}

impl RefreshOptions {
    pub(crate) fn header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::try_from(self.token_header_name.as_str()).map_err(|source| {
            ConfigError::HeaderName {
                name: self.token_header_name.clone(),
                source,
            }
        })
    }

    pub(crate) fn status_codes(&self) -> Result<Vec<StatusCode>, ConfigError> {
        self.invalid_token_statuses
            .iter()
            .map(|&s| StatusCode::from_u16(s).map_err(|_| ConfigError::Status(s)))
            .collect()
    }
}
