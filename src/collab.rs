//! Interfaces onto the data API, the conventional request/response layer
//! this service collaborates with. The gateway receives already-issued
//! tokens and already-committed writes; the only questions it ever asks
//! back are "who is this token" and "is this user in that conversation".

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

/// An authenticated identity as the data API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug)]
pub enum CollabError {
    /// The data API was unreachable or answered outside its contract.
    Upstream(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::Upstream(msg) => write!(f, "data API failure: {msg}"),
        }
    }
}

impl std::error::Error for CollabError {}

/// Maps a bearer token to an identity, or nothing if invalid/expired.
/// An `Err` means the question could not be answered, not "invalid".
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, CollabError>;
}

/// Conversation membership checks for DM authorization.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn is_member(&self, user_id: &str, conversation_id: &str)
        -> Result<bool, CollabError>;
}

/// HTTP client for both collaborator interfaces, against the data API's
/// internal endpoints.
pub struct DataApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl DataApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct IdentityResponse {
    user_id: String,
}

#[async_trait]
impl TokenValidator for DataApiClient {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, CollabError> {
        let resp = self
            .http
            .get(format!("{}/internal/identity", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CollabError::Upstream(e.to_string()))?;

        match resp.status() {
            reqwest::StatusCode::OK => {
                let body: IdentityResponse = resp
                    .json()
                    .await
                    .map_err(|e| CollabError::Upstream(e.to_string()))?;
                Ok(Some(Identity {
                    user_id: body.user_id,
                }))
            }
            reqwest::StatusCode::UNAUTHORIZED => Ok(None),
            status => Err(CollabError::Upstream(format!(
                "identity check returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl ConversationDirectory for DataApiClient {
    async fn is_member(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<bool, CollabError> {
        let resp = self
            .http
            .get(format!(
                "{}/internal/conversations/{conversation_id}/members/{user_id}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| CollabError::Upstream(e.to_string()))?;

        match resp.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(CollabError::Upstream(format!(
                "membership check returned {status}"
            ))),
        }
    }
}
