//! HTTP client for the tutor chat API.
//!
//! [`ChatClient`] owns the request half of a chat session: it opens the SSE
//! subscription for its scope and posts outbound user messages. Credentials
//! come from an injected [`CredentialProvider`], fetched fresh for every
//! request so reconnects never reuse an expired token.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, header};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::observability::{SEND_ERRORS, SENDS, SUBSCRIBES};
use crate::sse::process_sse;
use crate::types::{SendMessageRequest, SessionScope, StreamEvent};

const DEFAULT_BASE_URL: &str = "https://api.tutorstream.dev/v1/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A live, decoded subscription stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

//////////////////////////////////////// CredentialProvider ////////////////////////////////////////

/// Capability that yields the bearer credential for API calls.
///
/// The provider is consulted immediately before every subscribe and send, so
/// implementations backed by short-lived tokens can refresh transparently.
/// Returning `Ok(None)` means no credential is available; the call fails with
/// an authentication error and is never retried automatically.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the current bearer token, or `None` if unauthenticated.
    async fn bearer_token(&self) -> Result<Option<String>>;
}

/// A provider that always returns the same token. Useful for fixed-token
/// deployments and tests.
#[derive(Clone, Debug)]
pub struct StaticToken(pub String);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

//////////////////////////////////////////// Connect ////////////////////////////////////////////////

/// Connection factory used by the reconnect-supervised session.
///
/// Each call opens a brand-new subscription with a freshly fetched
/// credential. The session owns the returned stream exclusively.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Opens a fresh subscription stream.
    async fn connect(&self) -> Result<EventStream>;
}

//////////////////////////////////////////// ChatClient /////////////////////////////////////////////

/// Client for one chat conversation.
///
/// The scope is fixed at construction; a conversation with a different scope
/// requires a new client. Cloning is cheap and clones share the underlying
/// HTTP connection pool.
#[derive(Clone)]
pub struct ChatClient {
    scope: SessionScope,
    credentials: Arc<dyn CredentialProvider>,
    client: ReqwestClient,
    base_url: String,
    timeout: Duration,
}

impl ChatClient {
    /// Create a new client for the given scope.
    pub fn new(scope: SessionScope, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let timeout = DEFAULT_TIMEOUT;
        let client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            scope,
            credentials,
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
        })
    }

    /// Replaces the base URL. The URL should end with a trailing slash.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Replaces the connect timeout used for subscribe and send calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.timeout = timeout;
        self.client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(self)
    }

    /// Returns the scope this client is bound to.
    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    async fn bearer_header(&self) -> Result<HeaderValue> {
        let token = self
            .credentials
            .bearer_token()
            .await?
            .ok_or_else(|| Error::authentication("no credential available"))?;
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::authentication(format!("credential is not a valid header: {e}")))
    }

    async fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::AUTHORIZATION, self.bearer_header().await?);
        Ok(headers)
    }

    /// Maps a non-2xx response onto the error taxonomy.
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|val| val.to_str().ok())
            .map(String::from);

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        #[derive(Deserialize)]
        struct ErrorResponse {
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            #[serde(rename = "type")]
            error_type: Option<String>,
            message: Option<String>,
            param: Option<String>,
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let parsed_error = serde_json::from_str::<ErrorResponse>(&error_body).ok();
        let error_type = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.error_type.clone());
        let error_message = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| error_body.clone());
        let error_param = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.param.clone());

        match status_code {
            400 => Error::bad_request(error_message, error_param),
            401 => Error::authentication(error_message),
            404 => Error::not_found(error_message),
            408 => Error::timeout(error_message, None),
            429 => Error::rate_limit(error_message, retry_after),
            500 => Error::internal_server(error_message, request_id),
            502..=504 => Error::service_unavailable(error_message, retry_after),
            _ => Error::api(status_code, error_type, error_message, request_id),
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Open the SSE subscription for this client's scope.
    ///
    /// Fetches a fresh credential, then issues the subscribe GET with
    /// `Accept: text/event-stream` and returns the decoded event stream.
    /// Fails without retrying if no credential is available.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let url = format!("{}{}", self.base_url, self.scope.subscribe_path());

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::AUTHORIZATION, self.bearer_header().await?);

        SUBSCRIBES.click();
        let response = self
            .client
            .get(&url)
            .headers(headers)
            .query(&self.scope.subscribe_query())
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }

        let stream = response.bytes_stream();
        Ok(Box::pin(process_sse(stream)))
    }

    /// Post one outbound user message on the mode-appropriate endpoint.
    ///
    /// Does not touch local message state; the server answers over the
    /// subscription stream. Never retried: a failure propagates to the
    /// caller, which owns any optimistic-UI rollback.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let url = format!("{}{}", self.base_url, self.scope.send_path());
        let body = SendMessageRequest {
            message: text.into(),
        };

        SENDS.click();
        let response = self
            .client
            .post(&url)
            .headers(self.default_headers().await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                SEND_ERRORS.click();
                self.map_request_error(e)
            })?;

        if !response.status().is_success() {
            SEND_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        Ok(())
    }
}

#[async_trait]
impl Connect for ChatClient {
    async fn connect(&self) -> Result<EventStream> {
        self.subscribe().await
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("scope", &self.scope)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
