//! A token source that uses an OAuth2 token endpoint as an authority

use std::marker::PhantomData;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use super::AsyncTokenSource;
use crate::IssuedToken;

pub mod dto;

/// A token source performing the client credentials flow
#[derive(Debug)]
pub struct ClientCredentialsTokenSource<T = JsonBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    credentials: dto::ClientCredentialsRequest,
    headers: HeaderMap,
    content_type: PhantomData<fn() -> T>,
}

impl ClientCredentialsTokenSource<JsonBody> {
    /// Constructs a new client credentials source
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        credentials: dto::ClientCredentials,
    ) -> Self {
        Self {
            client,
            token_url,
            credentials: dto::ClientCredentialsRequest::new(credentials),
            headers: HeaderMap::new(),
            content_type: PhantomData,
        }
    }

    /// Configures the token source to send credentials to
    /// the authority as form data
    pub fn using_form_data(self) -> ClientCredentialsTokenSource<FormBody> {
        ClientCredentialsTokenSource {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            headers: self.headers,
            content_type: PhantomData,
        }
    }
}

impl<T> ClientCredentialsTokenSource<T> {
    /// Adds a header to every token request
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a field to the body of every token request, such as an `audience`
    ///
    /// Extra fields cannot replace `grant_type`, `client_id`, or `client_secret`.
    pub fn with_body_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.credentials.extra.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl<T: RequestType> AsyncTokenSource for ClientCredentialsTokenSource<T> {
    type Error = TokenRequestError;

    async fn request_token(&mut self) -> Result<IssuedToken, Self::Error> {
        request_token::<T>(
            &self.client,
            self.token_url.clone(),
            &self.headers,
            &self.credentials,
        )
        .await
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
}

#[tracing::instrument(
    err,
    skip(client, token_url, headers, credentials),
    fields(
        token_url = %token_url,
        credentials.grant_type = dto::ClientCredentialsRequest::GRANT_TYPE,
        credentials.client_id = %credentials.client_id(),
    ),
)]
async fn request_token<T: RequestType>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    headers: &HeaderMap,
    credentials: &dto::ClientCredentialsRequest,
) -> Result<IssuedToken, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let req = T::attach_payload(client.post(token_url).headers(headers.clone()), credentials);
    let resp = req.send().await.map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let token: IssuedToken = serde_json::from_slice(&body)?;

    tracing::info!(
        scheme = %token.scheme,
        has_scope = token.scope.is_some(),
        lifetime = token.expires_in,
        "received new token"
    );

    Ok(token)
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}
