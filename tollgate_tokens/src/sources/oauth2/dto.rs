//! DTOs for interacting with OAuth2 token endpoints

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::{ClientId, ClientIdRef, ClientSecret};

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// A client credentials grant request, with any extra body fields
#[derive(Debug)]
pub(crate) struct ClientCredentialsRequest {
    pub credentials: ClientCredentials,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClientCredentialsRequest {
    pub const GRANT_TYPE: &'static str = "client_credentials";
    const RESERVED: [&'static str; 3] = ["grant_type", "client_id", "client_secret"];

    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            credentials,
            extra: serde_json::Map::new(),
        }
    }

    pub fn client_id(&self) -> &ClientIdRef {
        &self.credentials.client_id
    }
}

impl Serialize for ClientCredentialsRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let extra = self
            .extra
            .iter()
            .filter(|(k, _)| !Self::RESERVED.contains(&k.as_str()));

        let mut ser = serializer.serialize_map(None)?;
        ser.serialize_entry("grant_type", Self::GRANT_TYPE)?;
        ser.serialize_entry("client_id", &self.credentials.client_id)?;
        ser.serialize_entry("client_secret", &self.credentials.client_secret)?;
        for (k, v) in extra {
            ser.serialize_entry(k, v)?;
        }
        ser.end()
    }
}
